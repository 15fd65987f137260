//! Challenge construction, parsing and replay protection.
//!
//! A challenge binds a public key, the alias it lives under and a one-time
//! nonce into the message the gated key signs:
//!
//! ```text
//! base64url(SEC1 public key) ":" alias ":" nonce
//! ```
//!
//! The base64 is padded, matching what existing verifiers expect. Neither an
//! alias nor a nonce may contain `:`, so the three fields split back
//! unambiguously.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use base64::{
    engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD},
    Engine as _,
};
use p256::ecdsa::{signature::Verifier, Signature, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use subtle::ConstantTimeEq;

use crate::config::GateConfig;
use crate::error::{KeyGateError, ReplayError};
use crate::platform::Clock;
use crate::types::{KeyAlias, PublicKeyBytes};

const NONCE_BYTES: usize = 32;
const MAX_NONCE_LEN: usize = 512;

/// One-time token embedded in a challenge.
#[derive(Clone, PartialEq, Eq)]
pub struct Nonce(String);

impl Nonce {
    /// Validates a nonce supplied by a server.
    ///
    /// # Errors
    /// Returns [`KeyGateError::InvalidInput`] unless the nonce is 1 to 512
    /// URL-safe characters (`A-Z a-z 0-9 - _ . ~ =`).
    pub fn new(value: impl Into<String>) -> Result<Self, KeyGateError> {
        let value = value.into();
        if value.is_empty() || value.len() > MAX_NONCE_LEN {
            return Err(KeyGateError::invalid_input(
                "nonce",
                format!("must be 1 to {MAX_NONCE_LEN} characters"),
            ));
        }
        if !value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~' | b'='))
        {
            return Err(KeyGateError::invalid_input(
                "nonce",
                "must only contain URL-safe characters",
            ));
        }
        Ok(Self(value))
    }

    /// The nonce text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(6).collect();
        write!(f, "Nonce({prefix}..)")
    }
}

/// Supplies a fresh nonce per challenge.
pub trait NonceProvider: Send + Sync {
    /// Issues a nonce that has never been issued before.
    ///
    /// # Errors
    /// Returns [`KeyGateError::Nonce`] if none can be obtained.
    fn issue(&self) -> Result<Nonce, KeyGateError>;
}

/// Tracks nonce consumption on the verifying side.
pub trait NonceVerifier: Send + Sync {
    /// Accepts `nonce` if it was issued, has not expired and was never
    /// consumed, marking it consumed.
    ///
    /// # Errors
    /// The [`ReplayError`] describing why the nonce is refused.
    fn consume(&self, nonce: &Nonce) -> Result<(), ReplayError>;
}

struct IssuedNonce {
    value: Nonce,
    expires_at_ms: u64,
    consumed: bool,
}

/// Local anti-replay store implementing both sides of the nonce contract.
///
/// Nonces are 32 random bytes, base64url encoded without padding. Entries are
/// kept one extra TTL past expiry so late replays report `Expired` or
/// `Reused` rather than `UnknownNonce`.
pub struct ReplayGuard {
    clock: Arc<dyn Clock>,
    ttl_ms: u64,
    issued: Mutex<Vec<IssuedNonce>>,
}

impl ReplayGuard {
    /// Creates a guard whose nonces live `ttl_ms` milliseconds.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, ttl_ms: u64) -> Self {
        Self {
            clock,
            ttl_ms,
            issued: Mutex::new(Vec::new()),
        }
    }

    /// Creates a guard using the configured `nonce_ttl_ms`.
    #[must_use]
    pub fn from_config(clock: Arc<dyn Clock>, config: &GateConfig) -> Self {
        Self::new(clock, config.nonce_ttl_ms)
    }

    fn prune(entries: &mut Vec<IssuedNonce>, now: u64, ttl_ms: u64) {
        entries.retain(|entry| entry.expires_at_ms.saturating_add(ttl_ms) > now);
    }

    /// Number of nonces currently tracked.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.issued.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl NonceProvider for ReplayGuard {
    fn issue(&self) -> Result<Nonce, KeyGateError> {
        let mut bytes = [0u8; NONCE_BYTES];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|err| KeyGateError::Nonce(err.to_string()))?;
        let nonce = Nonce(URL_SAFE_NO_PAD.encode(bytes));
        let now = self.clock.now_millis();
        let mut issued = self.issued.lock().unwrap_or_else(PoisonError::into_inner);
        Self::prune(&mut issued, now, self.ttl_ms);
        issued.push(IssuedNonce {
            value: nonce.clone(),
            expires_at_ms: now.saturating_add(self.ttl_ms),
            consumed: false,
        });
        Ok(nonce)
    }
}

impl NonceVerifier for ReplayGuard {
    fn consume(&self, nonce: &Nonce) -> Result<(), ReplayError> {
        let now = self.clock.now_millis();
        let mut issued = self.issued.lock().unwrap_or_else(PoisonError::into_inner);
        Self::prune(&mut issued, now, self.ttl_ms);

        // Compare against every entry so timing does not reveal which matched.
        let mut found = None;
        for (index, entry) in issued.iter().enumerate() {
            if bool::from(entry.value.0.as_bytes().ct_eq(nonce.0.as_bytes())) {
                found = Some(index);
            }
        }
        let entry = found
            .and_then(|index| issued.get_mut(index))
            .ok_or(ReplayError::UnknownNonce)?;
        if entry.consumed {
            log::warn!("rejected replayed nonce {nonce:?}");
            return Err(ReplayError::Reused);
        }
        if now >= entry.expires_at_ms {
            return Err(ReplayError::Expired);
        }
        entry.consumed = true;
        Ok(())
    }
}

/// Anti-replay message a signing key authorizes.
#[derive(Clone, PartialEq, Eq)]
pub struct Challenge {
    public_key: PublicKeyBytes,
    alias: KeyAlias,
    nonce: Nonce,
}

impl Challenge {
    /// Builds a challenge around a freshly issued nonce.
    ///
    /// # Errors
    /// Returns the provider's error if no nonce can be issued.
    pub fn build(
        public_key: PublicKeyBytes,
        alias: KeyAlias,
        nonces: &dyn NonceProvider,
    ) -> Result<Self, KeyGateError> {
        let nonce = nonces.issue()?;
        Ok(Self {
            public_key,
            alias,
            nonce,
        })
    }

    /// Reconstructs a challenge from its encoded form.
    ///
    /// # Errors
    /// Returns [`KeyGateError::InvalidInput`] if the message does not have
    /// exactly three well-formed fields.
    pub fn parse(message: &str) -> Result<Self, KeyGateError> {
        let mut fields = message.split(':');
        let (Some(public_key), Some(alias), Some(nonce), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(KeyGateError::invalid_input(
                "challenge",
                "expected `public_key:alias:nonce`",
            ));
        };
        let public_key = URL_SAFE
            .decode(public_key)
            .map_err(|err| KeyGateError::invalid_input("public_key", err.to_string()))?;
        Ok(Self {
            public_key: PublicKeyBytes::new(public_key),
            alias: KeyAlias::new(alias)?,
            nonce: Nonce::new(nonce)?,
        })
    }

    /// Encoded challenge string.
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}",
            URL_SAFE.encode(self.public_key.as_bytes()),
            self.alias,
            self.nonce.as_str()
        )
    }

    /// The exact bytes to sign.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode().into_bytes()
    }

    /// Public key of the signing key.
    #[must_use]
    pub const fn public_key(&self) -> &PublicKeyBytes {
        &self.public_key
    }

    /// Alias of the signing key.
    #[must_use]
    pub const fn alias(&self) -> &KeyAlias {
        &self.alias
    }

    /// Embedded nonce.
    #[must_use]
    pub const fn nonce(&self) -> &Nonce {
        &self.nonce
    }
}

impl fmt::Display for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Debug for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Challenge")
            .field("public_key", &self.public_key)
            .field("alias", &self.alias)
            .field("nonce", &self.nonce)
            .finish()
    }
}

/// Verifies signed challenges on the receiving side.
#[derive(Clone)]
pub struct ChallengeVerifier {
    nonces: Arc<dyn NonceVerifier>,
}

impl ChallengeVerifier {
    /// Creates a verifier consuming nonces from `nonces`.
    #[must_use]
    pub fn new(nonces: Arc<dyn NonceVerifier>) -> Self {
        Self { nonces }
    }

    /// Checks `signature_der` over `message` against the public key embedded
    /// in it, then consumes the nonce. The nonce is only consumed once the
    /// signature verifies.
    ///
    /// With `expected_public_key`, the embedded key must also be the one
    /// registered for the alias; without it any key the message names is
    /// trusted.
    ///
    /// # Errors
    /// `InvalidInput` for a malformed message, a foreign alias or an
    /// unregistered key, `InvalidSignature` if the signature does not verify,
    /// `Replay` if the nonce is refused.
    pub fn verify(
        &self,
        message: &[u8],
        signature_der: &[u8],
        expected_alias: &KeyAlias,
        expected_public_key: Option<&PublicKeyBytes>,
    ) -> Result<Challenge, KeyGateError> {
        let text = std::str::from_utf8(message)
            .map_err(|_| KeyGateError::invalid_input("challenge", "not valid UTF-8"))?;
        let challenge = Challenge::parse(text)?;
        if challenge.alias() != expected_alias {
            return Err(KeyGateError::invalid_input(
                "alias",
                format!("expected `{expected_alias}`, got `{}`", challenge.alias()),
            ));
        }
        if let Some(registered) = expected_public_key {
            if challenge.public_key() != registered {
                return Err(KeyGateError::invalid_input(
                    "public_key",
                    format!(
                        "signed by {}, `{expected_alias}` is registered to {}",
                        challenge.public_key().fingerprint(),
                        registered.fingerprint()
                    ),
                ));
            }
        }
        let key = VerifyingKey::from_sec1_bytes(challenge.public_key().as_bytes())
            .map_err(|_| KeyGateError::invalid_input("public_key", "not a P-256 point"))?;
        let signature =
            Signature::from_der(signature_der).map_err(|_| KeyGateError::InvalidSignature)?;
        key.verify(message, &signature)
            .map_err(|_| KeyGateError::InvalidSignature)?;
        self.nonces.consume(challenge.nonce())?;
        log::info!(
            "verified challenge for `{}` signed by {}",
            challenge.alias(),
            challenge.public_key().fingerprint()
        );
        Ok(challenge)
    }
}
