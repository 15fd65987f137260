//! Gate configuration.
//!
//! Hosts usually ship the configuration as JSON next to the rest of their
//! settings; every field has a default so an empty object is valid.

use serde::{Deserialize, Serialize};

use crate::{error::KeyGateError, types::KeyAlias};

/// Text shown by the platform biometric prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptInfo {
    /// Prompt title.
    pub title: String,
    /// Longer description under the title.
    pub description: String,
    /// Label of the negative (cancel) button.
    pub cancel_label: String,
}

impl Default for PromptInfo {
    fn default() -> Self {
        Self {
            title: "Verify it's you".to_string(),
            description: "Use your biometric to continue".to_string(),
            cancel_label: "Cancel".to_string(),
        }
    }
}

/// OS version thresholds used by the capability prober.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeThresholds {
    /// First OS version exposing biometric APIs at all.
    pub min_biometric_os_version: u32,
    /// First OS version whose prompt can gate a signature directly. Older
    /// versions fall back to the cipher-gated path.
    pub signature_prompt_os_version: u32,
}

impl Default for ProbeThresholds {
    fn default() -> Self {
        Self {
            min_biometric_os_version: 23,
            signature_prompt_os_version: 28,
        }
    }
}

/// Configuration for a [`BiometricGate`](crate::BiometricGate).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Alias of the signing key pair.
    pub signing_alias: KeyAlias,
    /// Alias of the symmetric cipher key.
    pub cipher_alias: KeyAlias,
    /// Generate keys that die when a new biometric is enrolled.
    pub invalidate_on_new_enrollment: bool,
    /// How long a sensor lockout blocks new sessions.
    pub lockout_cooldown_ms: u64,
    /// Lifetime of nonces issued by a [`ReplayGuard`](crate::ReplayGuard).
    pub nonce_ttl_ms: u64,
    /// Version thresholds.
    pub probe: ProbeThresholds,
    /// Default prompt text.
    pub prompt: PromptInfo,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            signing_alias: KeyAlias::from_static("keygate.signing"),
            cipher_alias: KeyAlias::from_static("keygate.cipher"),
            invalidate_on_new_enrollment: true,
            lockout_cooldown_ms: 30_000,
            nonce_ttl_ms: 300_000,
            probe: ProbeThresholds::default(),
            prompt: PromptInfo::default(),
        }
    }
}

impl GateConfig {
    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    /// Returns [`KeyGateError::Config`] if the JSON is malformed or the values
    /// are inconsistent.
    pub fn from_json(json: &str) -> Result<Self, KeyGateError> {
        let config: Self =
            serde_json::from_str(json).map_err(|err| KeyGateError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field invariants.
    ///
    /// # Errors
    /// Returns [`KeyGateError::Config`] describing the first violation.
    pub fn validate(&self) -> Result<(), KeyGateError> {
        if self.signing_alias == self.cipher_alias {
            return Err(KeyGateError::Config(
                "signing_alias and cipher_alias must differ".to_string(),
            ));
        }
        if self.probe.signature_prompt_os_version < self.probe.min_biometric_os_version {
            return Err(KeyGateError::Config(
                "signature_prompt_os_version is below min_biometric_os_version".to_string(),
            ));
        }
        if self.nonce_ttl_ms == 0 {
            return Err(KeyGateError::Config("nonce_ttl_ms must be positive".to_string()));
        }
        Ok(())
    }
}
