use std::fmt;

use secrecy::SecretSlice;
use thiserror::Error;

use crate::types::CBC_IV_LEN;

/// Result material produced by an authorized operation.
#[derive(Debug)]
pub enum Proof {
    /// DER encoded SHA-256 ECDSA signature over `message`.
    Signature {
        /// Exact bytes that were signed (the encoded challenge).
        message: Vec<u8>,
        /// DER encoded signature.
        signature_der: Vec<u8>,
    },
    /// AES-CBC ciphertext and the IV the store chose for it.
    Ciphertext {
        /// Initialization vector, needed to decrypt.
        iv: [u8; CBC_IV_LEN],
        /// PKCS#7 padded ciphertext.
        ciphertext: Vec<u8>,
    },
    /// Decrypted payload. Zeroized on drop.
    Plaintext(SecretSlice<u8>),
}

/// Terminal (or, for [`Failed`](Self::Failed), per-cycle) outcome of a session.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The biometric check passed and the operation was executed.
    Authenticated(Proof),
    /// The sensor rejected a sample. The session stays submitted and the user
    /// may try again with the same operation.
    Failed,
    /// The session ended with an error.
    Error(SessionError),
    /// The session was cancelled by the user or the caller.
    Cancelled,
}

impl SessionOutcome {
    /// Whether no further outcome will follow this one.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

/// When a session error may be retried with a fresh session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum Retryability {
    /// After the platform cooldown elapses.
    AfterCooldown {
        /// Milliseconds until the cooldown ends.
        cooldown_ms: u64,
    },
    /// After the user does something outside the prompt (unlock with the
    /// device credential, enroll a biometric, regenerate the key).
    AfterUserAction,
    /// Retrying will not help.
    Never,
}

/// Classified session error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum SessionErrorCode {
    /// Too many failed samples; the sensor is temporarily locked.
    Lockout,
    /// The sensor is locked until the user unlocks with the device credential.
    LockoutPermanent,
    /// The sensor is busy or unavailable.
    HardwareUnavailable,
    /// The prompt timed out.
    Timeout,
    /// Biometrics were removed while the prompt was up.
    NoBiometrics,
    /// The key was invalidated between binding and execution.
    KeyInvalidated,
    /// The authorized operation failed to execute.
    OperationFailed,
    /// The biometric service went away without reporting an outcome.
    Abandoned,
    /// Unclassified vendor specific code.
    Vendor {
        /// Raw code reported by the platform.
        code: i32,
    },
}

impl SessionErrorCode {
    /// Classifies a platform biometric error code, using the Android
    /// `BiometricPrompt` numbering. Returns `None` for codes that report a
    /// cancellation rather than an error.
    #[must_use]
    pub const fn from_platform_code(code: i32) -> Option<Self> {
        Some(match code {
            1 | 2 | 4 | 12 => Self::HardwareUnavailable,
            3 => Self::Timeout,
            // 5: canceled by system, 10: canceled by user, 13: negative button
            5 | 10 | 13 => return None,
            7 => Self::Lockout,
            9 => Self::LockoutPermanent,
            11 => Self::NoBiometrics,
            code => Self::Vendor { code },
        })
    }

    /// Default retry classification for the code.
    #[must_use]
    pub const fn retryability(self, lockout_cooldown_ms: u64) -> Retryability {
        match self {
            Self::Lockout => Retryability::AfterCooldown {
                cooldown_ms: lockout_cooldown_ms,
            },
            Self::LockoutPermanent
            | Self::Timeout
            | Self::NoBiometrics
            | Self::KeyInvalidated
            | Self::Abandoned => Retryability::AfterUserAction,
            Self::HardwareUnavailable | Self::OperationFailed | Self::Vendor { .. } => {
                Retryability::Never
            }
        }
    }
}

impl fmt::Display for SessionErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lockout => f.write_str("lockout"),
            Self::LockoutPermanent => f.write_str("lockout_permanent"),
            Self::HardwareUnavailable => f.write_str("hardware_unavailable"),
            Self::Timeout => f.write_str("timeout"),
            Self::NoBiometrics => f.write_str("no_biometrics"),
            Self::KeyInvalidated => f.write_str("key_invalidated"),
            Self::OperationFailed => f.write_str("operation_failed"),
            Self::Abandoned => f.write_str("abandoned"),
            Self::Vendor { code } => write!(f, "vendor_{code}"),
        }
    }
}

/// Session-ending error, delivered through the outcome callback only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct SessionError {
    /// Classified code.
    pub code: SessionErrorCode,
    /// Human readable detail from the platform or the store.
    pub message: String,
    /// When a new session may succeed.
    pub retry: Retryability,
}

impl SessionError {
    pub(crate) fn new(
        code: SessionErrorCode,
        message: impl Into<String>,
        retry: Retryability,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            retry,
        }
    }
}
