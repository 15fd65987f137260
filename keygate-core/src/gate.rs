//! End-to-end flow: probe, ensure key, build challenge, bind, authenticate.

use std::sync::Arc;

use crate::capability::{AuthPath, CapabilityProber, Readiness};
use crate::challenge::{Challenge, NonceProvider};
use crate::config::GateConfig;
use crate::error::{KeyGateError, KeyStoreError};
use crate::keys::KeyManager;
use crate::operation::{CipherMode, OperationBinder};
use crate::platform::{BiometricService, Clock, PlatformProbe, SecureKeyStore};
use crate::session::{
    AuthRequest, CancelHandle, FailedObserver, LockoutTracker, PendingOutcome, SessionLauncher,
    SessionOutcome,
};
use crate::types::{KeyAlias, KeyPolicy, KeyPurpose, CBC_IV_LEN};

/// Platform services a [`BiometricGate`] runs on.
#[derive(Clone)]
pub struct Platform {
    /// Device capability probe.
    pub probe: Arc<dyn PlatformProbe>,
    /// Secure key store.
    pub key_store: Arc<dyn SecureKeyStore>,
    /// Biometric prompt.
    pub biometric: Arc<dyn BiometricService>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// Biometric-gated key usage for one application.
///
/// Holds one signing alias and one cipher alias from its [`GateConfig`]. All
/// sessions started through a gate share its lockout state.
///
/// # Example
///
/// ```
/// use keygate_core::platform::memory::MemoryPlatform;
/// use keygate_core::{BiometricGate, GateConfig, ReplayGuard, SessionOutcome};
///
/// let platform = MemoryPlatform::new();
/// let gate = BiometricGate::new(GateConfig::default(), platform.platform()).unwrap();
/// let nonces = ReplayGuard::from_config(platform.clock.clone(), gate.config());
///
/// let request = gate.prepare_signature(&nonces).unwrap();
/// let _cancel = gate
///     .start(request, |outcome| {
///         if let SessionOutcome::Authenticated(proof) = outcome {
///             println!("signed: {proof:?}");
///         }
///     })
///     .unwrap();
/// platform.biometric.succeed();
/// ```
pub struct BiometricGate {
    config: GateConfig,
    prober: CapabilityProber,
    keys: KeyManager,
    binder: OperationBinder,
    sessions: SessionLauncher,
}

impl BiometricGate {
    /// Creates a gate.
    ///
    /// # Errors
    /// Returns [`KeyGateError::Config`] for an inconsistent configuration.
    pub fn new(config: GateConfig, platform: Platform) -> Result<Self, KeyGateError> {
        config.validate()?;
        let lockout = Arc::new(LockoutTracker::new(
            Arc::clone(&platform.clock),
            config.lockout_cooldown_ms,
        ));
        Ok(Self {
            prober: CapabilityProber::new(platform.probe, config.probe),
            keys: KeyManager::new(Arc::clone(&platform.key_store)),
            binder: OperationBinder::new(platform.key_store),
            sessions: SessionLauncher::new(platform.biometric, lockout, config.prompt.clone()),
            config,
        })
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Key manager for direct key inspection.
    #[must_use]
    pub const fn keys(&self) -> &KeyManager {
        &self.keys
    }

    /// Shared lockout state.
    #[must_use]
    pub fn lockout(&self) -> &LockoutTracker {
        self.sessions.lockout()
    }

    /// Probes the device afresh.
    #[must_use]
    pub fn readiness(&self) -> Readiness {
        self.prober.probe()
    }

    fn signing_policy(&self) -> KeyPolicy {
        KeyPolicy::signing(self.config.invalidate_on_new_enrollment)
    }

    fn cipher_policy(&self) -> KeyPolicy {
        KeyPolicy::symmetric(self.config.invalidate_on_new_enrollment)
    }

    /// Prepares a signature over a fresh challenge with the signing key,
    /// generating the key pair on first use.
    ///
    /// # Errors
    /// `Capability` if the device is not ready (no key operation is attempted
    /// then), `KeyStore`, `OperationBind` (notably `KeyInvalidated`) or the
    /// nonce provider's error.
    pub fn prepare_signature(
        &self,
        nonces: &dyn NonceProvider,
    ) -> Result<AuthRequest, KeyGateError> {
        self.readiness().require()?;
        let alias = &self.config.signing_alias;
        self.keys.ensure_asymmetric_key(alias, &self.signing_policy())?;
        let pair = self
            .keys
            .lookup_key_pair(alias)?
            .ok_or_else(|| KeyStoreError::KeyNotFound {
                alias: alias.clone(),
            })?;
        let challenge = Challenge::build(pair.public_key.clone(), alias.clone(), nonces)?;
        let operation = self.binder.bind_signer(&pair.private_key)?;
        AuthRequest::sign(operation, &challenge)
    }

    /// Prepares encryption of `payload` with the cipher key, generating the
    /// key on first use.
    ///
    /// # Errors
    /// As for [`prepare_signature`](Self::prepare_signature).
    pub fn prepare_encryption(&self, payload: &[u8]) -> Result<AuthRequest, KeyGateError> {
        self.readiness().require()?;
        let alias = &self.config.cipher_alias;
        self.keys.ensure_symmetric_key(alias, &self.cipher_policy())?;
        let operation = self.binder.bind_cipher(alias, CipherMode::Encrypt)?;
        AuthRequest::encrypt(operation, payload)
    }

    /// Prepares decryption of data produced by an earlier encryption.
    ///
    /// # Errors
    /// `InvalidInput` for an IV that is not 16 bytes or a malformed
    /// ciphertext, otherwise as for [`prepare_encryption`](Self::prepare_encryption).
    pub fn prepare_decryption(
        &self,
        iv: &[u8],
        ciphertext: &[u8],
    ) -> Result<AuthRequest, KeyGateError> {
        let iv: [u8; CBC_IV_LEN] = iv.try_into().map_err(|_| {
            KeyGateError::invalid_input("iv", format!("must be {CBC_IV_LEN} bytes"))
        })?;
        self.readiness().require()?;
        let alias = &self.config.cipher_alias;
        self.keys.ensure_symmetric_key(alias, &self.cipher_policy())?;
        let operation = self.binder.bind_cipher(alias, CipherMode::Decrypt { iv })?;
        AuthRequest::decrypt(operation, ciphertext)
    }

    /// Prepares whichever proof the device's auth path supports: a signed
    /// challenge on signature-gated platforms, an encrypted fresh nonce on
    /// cipher-gated ones.
    ///
    /// # Errors
    /// As for [`prepare_signature`](Self::prepare_signature).
    pub fn prepare(&self, nonces: &dyn NonceProvider) -> Result<AuthRequest, KeyGateError> {
        match self.readiness().require()? {
            AuthPath::SignatureGated => self.prepare_signature(nonces),
            AuthPath::CipherGated => {
                let nonce = nonces.issue()?;
                self.prepare_encryption(nonce.as_str().as_bytes())
            }
        }
    }

    /// Starts a session for `request`; see [`SessionLauncher::start`].
    ///
    /// # Errors
    /// [`KeyGateError::SessionBusy`] if the alias already has a session in
    /// flight.
    pub fn start<F>(
        &self,
        request: AuthRequest,
        on_outcome: F,
    ) -> Result<CancelHandle, KeyGateError>
    where
        F: FnMut(SessionOutcome) + Send + 'static,
    {
        self.sessions.start(request, on_outcome)
    }

    /// Starts a session and returns a future for its terminal outcome. Soft
    /// `Failed` outcomes go to `on_failed`.
    ///
    /// # Errors
    /// As for [`start`](Self::start).
    pub fn authenticate(
        &self,
        request: AuthRequest,
        on_failed: Option<FailedObserver>,
    ) -> Result<(CancelHandle, PendingOutcome), KeyGateError> {
        self.sessions.authenticate(request, on_failed)
    }

    /// Deletes the key serving `purpose`, so the next prepare generates a
    /// fresh one. This is the recovery for an invalidated key.
    ///
    /// # Errors
    /// Any key store failure.
    pub fn reset_key(&self, purpose: KeyPurpose) -> Result<bool, KeyGateError> {
        let alias = self.alias_for(purpose);
        let existed = self.keys.delete_key(alias)?;
        log::info!("reset key `{alias}` for {purpose} (existed: {existed})");
        Ok(existed)
    }

    /// Alias the gate uses for `purpose`.
    #[must_use]
    pub const fn alias_for(&self, purpose: KeyPurpose) -> &KeyAlias {
        match purpose {
            KeyPurpose::Sign | KeyPurpose::Verify => &self.config.signing_alias,
            KeyPurpose::Encrypt | KeyPurpose::Decrypt => &self.config.cipher_alias,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CapabilityError;
    use crate::platform::memory::MemoryPlatform;
    use crate::ReplayGuard;

    fn gate(platform: &MemoryPlatform) -> BiometricGate {
        BiometricGate::new(GateConfig::default(), platform.platform()).expect("gate")
    }

    #[test]
    fn test_not_ready_touches_no_keys() {
        let platform = MemoryPlatform::new();
        platform.device.set_device_secure(false);
        let gate = gate(&platform);
        let nonces = ReplayGuard::new(platform.clock.clone(), 1_000);
        assert!(matches!(
            gate.prepare_signature(&nonces),
            Err(KeyGateError::Capability(CapabilityError::LockscreenNotSecure))
        ));
        assert!(platform.blob_store.is_empty());
    }

    #[test]
    fn test_prepare_picks_cipher_path_on_old_os() {
        let platform = MemoryPlatform::new();
        platform.device.set_os_version(26);
        let gate = gate(&platform);
        let nonces = ReplayGuard::new(platform.clock.clone(), 1_000);
        let request = gate.prepare(&nonces).expect("prepare");
        assert_eq!(request.operation().kind(), crate::types::OperationKind::Encrypt);
        assert_eq!(request.operation().alias(), &gate.config().cipher_alias);
    }

    #[test]
    fn test_prepare_picks_signature_path() {
        let platform = MemoryPlatform::new();
        let gate = gate(&platform);
        let nonces = ReplayGuard::new(platform.clock.clone(), 1_000);
        let request = gate.prepare(&nonces).expect("prepare");
        assert_eq!(request.operation().kind(), crate::types::OperationKind::Sign);
    }

    #[test]
    fn test_decryption_iv_length_checked() {
        let platform = MemoryPlatform::new();
        let gate = gate(&platform);
        assert!(matches!(
            gate.prepare_decryption(&[0; 8], &[0; 16]),
            Err(KeyGateError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_reset_key() {
        let platform = MemoryPlatform::new();
        let gate = gate(&platform);
        assert!(!gate.reset_key(KeyPurpose::Sign).expect("reset"));
        gate.prepare_encryption(b"x").expect("prepare");
        assert!(gate.reset_key(KeyPurpose::Decrypt).expect("reset"));
        assert!(gate
            .keys()
            .describe(&gate.config().cipher_alias)
            .expect("describe")
            .is_none());
    }
}
