use thiserror::Error;

use crate::types::{KeyAlgorithm, KeyAlias, KeyPurpose};

/// Result type for key store operations.
pub type KeyStoreResult<T> = Result<T, KeyStoreError>;

/// Device cannot currently perform biometric authentication.
///
/// None of these are retryable without user action outside the application
/// (updating the OS, setting a lock screen, enrolling a biometric).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[cfg_attr(feature = "ffi", derive(uniffi::Error))]
#[cfg_attr(feature = "ffi", uniffi(flat_error))]
pub enum CapabilityError {
    /// The OS predates biometric APIs.
    #[error("unsupported_os: version {found}, biometric APIs need {required}")]
    UnsupportedOs {
        /// Version reported by the platform.
        found: u32,
        /// Minimum version with biometric APIs.
        required: u32,
    },
    /// No biometric sensor is present.
    #[error("no_biometric_hardware")]
    NoHardware,
    /// No secure lock screen is configured.
    #[error("lockscreen_not_secure")]
    LockscreenNotSecure,
    /// No biometric template is enrolled.
    #[error("no_enrolled_biometric")]
    NoEnrolledBiometric,
}

/// Errors raised by the platform secure key store.
#[derive(Debug, Error)]
#[cfg_attr(feature = "ffi", derive(uniffi::Error))]
#[cfg_attr(feature = "ffi", uniffi(flat_error))]
pub enum KeyStoreError {
    /// The store cannot be reached.
    #[error("keystore_unavailable: {0}")]
    Unavailable(String),
    /// Stored key records are unreadable or fail authentication.
    #[error("keystore_corrupted: {0}")]
    Corrupted(String),
    /// The requested algorithm or parameters are not supported.
    #[error("unsupported_algorithm: {0}")]
    UnsupportedAlgorithm(String),
    /// The requested policy is not allowed for generated keys.
    #[error("policy_rejected: {0}")]
    PolicyRejected(String),
    /// A key exists under the alias with a different policy.
    #[error("policy_mismatch: key `{alias}` exists with a different policy")]
    PolicyMismatch {
        /// Alias of the existing key.
        alias: KeyAlias,
    },
    /// No key under the alias.
    #[error("key_not_found: {alias}")]
    KeyNotFound {
        /// Alias that was looked up.
        alias: KeyAlias,
    },
    /// The key was permanently invalidated (e.g. new biometric enrollment).
    #[error("key_invalidated: {alias}")]
    KeyInvalidated {
        /// Alias of the invalidated key.
        alias: KeyAlias,
    },
    /// The operation was not authorized by the biometric gate.
    #[error("not_authorized")]
    NotAuthorized,
    /// The operation is unknown, already finished or aborted.
    #[error("operation_not_found")]
    OperationNotFound,
    /// A cryptographic primitive failed.
    #[error("crypto_error: {0}")]
    Crypto(String),
    /// Key record encoding failed.
    #[error("serialization_error: {0}")]
    Serialization(String),
    /// The backing blob store failed.
    #[error("blob_store_error: {0}")]
    BlobStore(String),
}

/// Failure to bind a key into an operation.
#[derive(Debug, Error)]
#[cfg_attr(feature = "ffi", derive(uniffi::Error))]
#[cfg_attr(feature = "ffi", uniffi(flat_error))]
pub enum OperationBindError {
    /// The key was invalidated since creation; it must be deleted and
    /// regenerated before retrying.
    #[error("key invalidated, re-enroll key `{alias}`")]
    KeyInvalidated {
        /// Alias of the invalidated key.
        alias: KeyAlias,
    },
    /// No key under the alias, or the handle refers to a key that was
    /// replaced.
    #[error("key_not_found: {alias}")]
    KeyNotFound {
        /// Alias of the missing key.
        alias: KeyAlias,
    },
    /// The key policy does not permit the requested purpose.
    #[error("purpose_not_allowed: `{alias}` cannot {purpose}")]
    PurposeNotAllowed {
        /// Alias of the key.
        alias: KeyAlias,
        /// Purpose that was requested.
        purpose: KeyPurpose,
    },
    /// The key is of the wrong kind for the requested operation.
    #[error("wrong_key_kind: `{alias}` is {found}")]
    WrongKeyKind {
        /// Alias of the key.
        alias: KeyAlias,
        /// Algorithm of the key found.
        found: KeyAlgorithm,
    },
    /// Any other store failure.
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),
}

impl OperationBindError {
    /// Whether the caller should delete and regenerate the key.
    #[must_use]
    pub const fn requires_new_key(&self) -> bool {
        matches!(self, Self::KeyInvalidated { .. })
    }
}

/// Rejection of a challenge nonce by the verifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[cfg_attr(feature = "ffi", derive(uniffi::Error))]
#[cfg_attr(feature = "ffi", uniffi(flat_error))]
pub enum ReplayError {
    /// The nonce was never issued by this verifier.
    #[error("unknown_nonce")]
    UnknownNonce,
    /// The nonce was issued but its lifetime elapsed.
    #[error("expired_nonce")]
    Expired,
    /// The nonce was already consumed once.
    #[error("nonce_reused")]
    Reused,
}

/// Error outputs from `Keygate`.
#[derive(Debug, Error)]
#[cfg_attr(feature = "ffi", derive(uniffi::Error))]
#[cfg_attr(feature = "ffi", uniffi(flat_error))]
pub enum KeyGateError {
    /// The device is not ready for biometric authentication.
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    /// Key store failure.
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),
    /// Binding a key into an operation failed.
    #[error(transparent)]
    OperationBind(#[from] OperationBindError),
    /// A session for the alias is already in flight.
    #[error("session_busy: an authentication for `{alias}` is already in flight")]
    SessionBusy {
        /// Alias with a pending session.
        alias: KeyAlias,
    },
    /// The presented input is not valid for the requested operation.
    #[error("invalid_input_{attribute}: {reason}")]
    InvalidInput {
        /// Name of the offending input.
        attribute: String,
        /// What is wrong with it.
        reason: String,
    },
    /// Configuration could not be loaded.
    #[error("invalid_config: {0}")]
    Config(String),
    /// The nonce provider could not supply a nonce.
    #[error("nonce_unavailable: {0}")]
    Nonce(String),
    /// Challenge verification rejected the nonce.
    #[error(transparent)]
    Replay(#[from] ReplayError),
    /// Challenge signature did not verify.
    #[error("invalid_signature")]
    InvalidSignature,
}

impl KeyGateError {
    pub(crate) fn invalid_input(attribute: &str, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            attribute: attribute.to_string(),
            reason: reason.into(),
        }
    }
}
