//! Identifiers, key policy and handle types shared by every component.
//!
//! None of these types carry secret key material. A [`KeyHandle`] only names a
//! key inside the platform store; the bytes stay behind the
//! [`SecureKeyStore`](crate::platform::SecureKeyStore) boundary.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::error::KeyGateError;

/// Upper bound on alias length, in bytes.
const MAX_ALIAS_LEN: usize = 128;

/// Size of the CBC initialization vector used by symmetric keys.
pub const CBC_IV_LEN: usize = 16;

/// Stable name under which a key is stored and retrieved.
///
/// Aliases are scoped per logical purpose (one for signing, one for cipher
/// operations) and are injected through [`GateConfig`](crate::GateConfig).
/// Because challenges are colon-joined, an alias may not contain `:`,
/// whitespace or control characters.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyAlias(String);

impl KeyAlias {
    /// Validates and wraps an alias.
    ///
    /// # Errors
    /// Returns [`KeyGateError::InvalidInput`] if the alias is empty, too long,
    /// or contains a reserved character.
    pub fn new(alias: impl Into<String>) -> Result<Self, KeyGateError> {
        let alias = alias.into();
        if alias.is_empty() {
            return Err(KeyGateError::invalid_input("alias", "must not be empty"));
        }
        if alias.len() > MAX_ALIAS_LEN {
            return Err(KeyGateError::invalid_input(
                "alias",
                format!("must be at most {MAX_ALIAS_LEN} bytes"),
            ));
        }
        if let Some(c) = alias
            .chars()
            .find(|c| *c == ':' || c.is_whitespace() || c.is_control())
        {
            return Err(KeyGateError::invalid_input(
                "alias",
                format!("contains reserved character {c:?}"),
            ));
        }
        Ok(Self(alias))
    }

    /// Wraps a compile-time alias known to be valid.
    pub(crate) fn from_static(alias: &'static str) -> Self {
        debug_assert!(Self::new(alias).is_ok(), "invalid static alias {alias}");
        Self(alias.to_string())
    }

    /// Returns the alias as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for KeyAlias {
    type Error = KeyGateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for KeyAlias {
    type Error = KeyGateError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<KeyAlias> for String {
    fn from(alias: KeyAlias) -> Self {
        alias.0
    }
}

impl fmt::Display for KeyAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for KeyAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyAlias({})", self.0)
    }
}

/// What a key may be used for.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum KeyPurpose {
    /// Encrypt a payload (symmetric keys).
    Encrypt,
    /// Decrypt a payload (symmetric keys).
    Decrypt,
    /// Produce a signature (asymmetric keys).
    Sign,
    /// Verify a signature (asymmetric keys).
    Verify,
}

/// Key algorithm and its fixed parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum KeyAlgorithm {
    /// AES-256 in CBC mode with PKCS#7 padding.
    #[strum(to_string = "AES/CBC/PKCS7")]
    Aes256CbcPkcs7,
    /// ECDSA over NIST P-256 (secp256r1) with SHA-256 digests.
    #[strum(to_string = "EC/secp256r1")]
    EcP256,
}

impl KeyAlgorithm {
    /// Whether keys of this algorithm are a single secret key.
    #[must_use]
    pub const fn is_symmetric(self) -> bool {
        matches!(self, Self::Aes256CbcPkcs7)
    }

    /// Whether `purpose` makes sense for this algorithm.
    #[must_use]
    pub const fn supports(self, purpose: KeyPurpose) -> bool {
        match self {
            Self::Aes256CbcPkcs7 => matches!(purpose, KeyPurpose::Encrypt | KeyPurpose::Decrypt),
            Self::EcP256 => matches!(purpose, KeyPurpose::Sign | KeyPurpose::Verify),
        }
    }
}

/// Authorization policy a key is generated under.
///
/// Immutable once a key exists: changing it means deleting the key and
/// generating a new one under the same alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPolicy {
    /// Allowed purposes.
    pub purposes: BTreeSet<KeyPurpose>,
    /// Algorithm and parameters.
    pub algorithm: KeyAlgorithm,
    /// Every use of the key needs a fresh biometric authorization.
    pub require_user_authentication: bool,
    /// Enrolling a new biometric permanently invalidates the key.
    pub invalidate_on_new_enrollment: bool,
}

impl KeyPolicy {
    /// Policy for an AES-256/CBC/PKCS7 key usable for encrypt and decrypt.
    #[must_use]
    pub fn symmetric(invalidate_on_new_enrollment: bool) -> Self {
        Self {
            purposes: [KeyPurpose::Encrypt, KeyPurpose::Decrypt].into_iter().collect(),
            algorithm: KeyAlgorithm::Aes256CbcPkcs7,
            require_user_authentication: true,
            invalidate_on_new_enrollment,
        }
    }

    /// Policy for a P-256 signing key pair.
    #[must_use]
    pub fn signing(invalidate_on_new_enrollment: bool) -> Self {
        Self {
            purposes: std::iter::once(KeyPurpose::Sign).collect(),
            algorithm: KeyAlgorithm::EcP256,
            require_user_authentication: true,
            invalidate_on_new_enrollment,
        }
    }

    /// Whether the policy permits `purpose`.
    #[must_use]
    pub fn allows(&self, purpose: KeyPurpose) -> bool {
        self.purposes.contains(&purpose)
    }

    /// Checks the policy is one this system will generate keys under.
    ///
    /// # Errors
    /// Returns a description of the first violated rule.
    pub fn check(&self) -> Result<(), String> {
        if !self.require_user_authentication {
            return Err("keys must require user authentication".to_string());
        }
        if self.purposes.is_empty() {
            return Err("at least one purpose is required".to_string());
        }
        if let Some(purpose) = self.purposes.iter().find(|p| !self.algorithm.supports(**p)) {
            return Err(format!("{} does not support purpose {purpose}", self.algorithm));
        }
        Ok(())
    }
}

/// Random identifier of one generated key.
///
/// Regenerating a key under the same alias produces a new `KeyId`, which lets
/// the store detect handles that outlived the key they were bound to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId(pub [u8; 16]);

impl KeyId {
    /// Generates a fresh random key id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// Hex encoding of the id.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.to_hex())
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Identifier of one in-progress store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Generates a new operation id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Raw id bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of one authentication attempt (one `start` call).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(Uuid);

impl AttemptId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Public half of an asymmetric key, as a SEC1 uncompressed point (65 bytes).
///
/// Safe to transmit.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeyBytes(Vec<u8>);

impl PublicKeyBytes {
    /// Wraps an encoded public key.
    #[must_use]
    pub const fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The encoded key.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Short SHA-256 fingerprint, suitable for logs.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        hex::encode(&Sha256::digest(&self.0)[..8])
    }
}

impl fmt::Debug for PublicKeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKeyBytes({})", self.fingerprint())
    }
}

/// Everything the store reports about a key, minus its secret material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDescriptor {
    /// Alias the key lives under.
    pub alias: KeyAlias,
    /// Identity of this particular generated key.
    pub key_id: KeyId,
    /// Policy it was generated with.
    pub policy: KeyPolicy,
    /// Public key, for asymmetric keys.
    pub public_key: Option<PublicKeyBytes>,
    /// Set once the platform has permanently invalidated the key.
    pub invalidated: bool,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at_ms: u64,
}

/// Opaque reference to a key held by the platform store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHandle {
    alias: KeyAlias,
    key_id: KeyId,
    algorithm: KeyAlgorithm,
}

impl KeyHandle {
    pub(crate) fn from_descriptor(descriptor: &KeyDescriptor) -> Self {
        Self {
            alias: descriptor.alias.clone(),
            key_id: descriptor.key_id,
            algorithm: descriptor.policy.algorithm,
        }
    }

    /// Alias of the referenced key.
    #[must_use]
    pub const fn alias(&self) -> &KeyAlias {
        &self.alias
    }

    /// Identity of the referenced key.
    #[must_use]
    pub const fn key_id(&self) -> KeyId {
        self.key_id
    }

    /// Algorithm of the referenced key.
    #[must_use]
    pub const fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }
}

/// Public key plus a handle to its private half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    /// Transmittable public key.
    pub public_key: PublicKeyBytes,
    /// Handle to the private key inside the store.
    pub private_key: KeyHandle,
}

/// Cryptographic action a store operation will perform once authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// AES-CBC encryption; the store picks the IV when the operation begins.
    Encrypt,
    /// AES-CBC decryption under the IV used for encryption.
    Decrypt {
        /// Initialization vector produced by the matching encryption.
        iv: [u8; CBC_IV_LEN],
    },
    /// SHA-256 ECDSA signature, DER encoded.
    Sign,
}

impl OperationKind {
    /// Key purpose the operation requires.
    #[must_use]
    pub const fn purpose(&self) -> KeyPurpose {
        match self {
            Self::Encrypt => KeyPurpose::Encrypt,
            Self::Decrypt { .. } => KeyPurpose::Decrypt,
            Self::Sign => KeyPurpose::Sign,
        }
    }
}

/// Proof that the biometric gate released exactly one operation.
///
/// Issued by the biometric service on success. The key store refuses to
/// finish an operation unless the token names that operation and its tag
/// verifies; for the software store that means it was minted by the shared
/// [`TokenAuthority`](crate::platform::TokenAuthority).
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    operation: OperationId,
    authenticated_at_ms: u64,
    tag: Vec<u8>,
}

impl AuthToken {
    /// Wraps a token attested by the platform. `tag` is whatever the key
    /// store verifies.
    #[must_use]
    pub const fn new(operation: OperationId, authenticated_at_ms: u64, tag: Vec<u8>) -> Self {
        Self {
            operation,
            authenticated_at_ms,
            tag,
        }
    }

    /// Operation the user authorized.
    #[must_use]
    pub const fn operation(&self) -> OperationId {
        self.operation
    }

    /// When the authorization happened, in milliseconds since the Unix epoch.
    #[must_use]
    pub const fn authenticated_at_ms(&self) -> u64 {
        self.authenticated_at_ms
    }

    /// Attestation tag.
    #[must_use]
    pub fn tag(&self) -> &[u8] {
        &self.tag
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("operation", &self.operation)
            .field("authenticated_at_ms", &self.authenticated_at_ms)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("keygate.signing" ; "dotted")]
    #[test_case("default_key" ; "underscore")]
    #[test_case("a" ; "single char")]
    fn test_alias_accepts(alias: &str) {
        assert_eq!(KeyAlias::new(alias).expect("valid").as_str(), alias);
    }

    #[test_case("" ; "empty")]
    #[test_case("a:b" ; "colon")]
    #[test_case("a b" ; "space")]
    #[test_case("line\nbreak" ; "control")]
    fn test_alias_rejects(alias: &str) {
        assert!(matches!(
            KeyAlias::new(alias),
            Err(KeyGateError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_alias_rejects_overlong() {
        assert!(KeyAlias::new("x".repeat(MAX_ALIAS_LEN + 1)).is_err());
        assert!(KeyAlias::new("x".repeat(MAX_ALIAS_LEN)).is_ok());
    }

    #[test]
    fn test_alias_serde_validates() {
        let alias: KeyAlias = serde_json::from_str("\"signing\"").expect("valid");
        assert_eq!(alias.as_str(), "signing");
        assert!(serde_json::from_str::<KeyAlias>("\"bad:alias\"").is_err());
    }

    #[test]
    fn test_default_policies_pass_check() {
        assert!(KeyPolicy::symmetric(true).check().is_ok());
        assert!(KeyPolicy::signing(false).check().is_ok());
    }

    #[test]
    fn test_policy_without_user_auth_rejected() {
        let mut policy = KeyPolicy::signing(true);
        policy.require_user_authentication = false;
        assert!(policy.check().is_err());
    }

    #[test]
    fn test_policy_with_foreign_purpose_rejected() {
        let mut policy = KeyPolicy::symmetric(true);
        policy.purposes.insert(KeyPurpose::Sign);
        let err = policy.check().expect_err("sign is not an AES purpose");
        assert!(err.contains("sign"));
    }

    #[test]
    fn test_purpose_parses_lowercase() {
        assert_eq!("encrypt".parse::<KeyPurpose>().expect("parse"), KeyPurpose::Encrypt);
        assert_eq!(KeyPurpose::Sign.to_string(), "sign");
    }
}
