//! Biometric-gated device keys. See [`keygate_core`] for the full API.

pub use keygate_core::*;

/// Result of fallible gate calls.
pub type KeyGateResult<T, E = KeyGateError> = std::result::Result<T, E>;
