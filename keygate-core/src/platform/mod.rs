//! Platform abstraction traits.
//!
//! The gate never talks to a sensor or a hardware keystore directly. Every
//! platform capability it consumes is a trait the host implements:
//!
//! - [`PlatformProbe`]: biometric hardware, lock screen and enrollment state
//! - [`SecureKeyStore`]: alias-addressed key generation and gated operations
//! - [`BiometricService`]: the prompt that authorizes one operation
//! - [`Clock`]: wall time for lockout cooldowns and nonce expiry
//!
//! # Platform Implementations
//!
//! ## Android (Kotlin)
//! - `PlatformProbe`: `KeyguardManager` + `BiometricManager`
//! - `SecureKeyStore`: Android Keystore (`setUserAuthenticationRequired`)
//! - `BiometricService`: `BiometricPrompt` with a `CryptoObject`
//!
//! ## iOS (Swift)
//! - `PlatformProbe`: `LAContext.canEvaluatePolicy`
//! - `SecureKeyStore`: Secure Enclave keys with `.biometryCurrentSet`
//! - `BiometricService`: `LAContext.evaluatePolicy`
//!
//! ## Hosts without a secure element
//! - `SecureKeyStore`: [`SoftwareKeyStore`] sealing records under a
//!   [`DeviceKeystore`] into an [`AtomicBlobStore`]
//! - `BiometricService`: any prompt that shares a [`TokenAuthority`] with the
//!   store and mints a token only after the user was verified
//!
//! The [`memory`] module provides simulated implementations for tests.

mod authority;
mod blob_store;
mod device_keystore;
pub mod memory;
mod vault;

use std::time::{SystemTime, UNIX_EPOCH};

pub use authority::TokenAuthority;
pub use blob_store::FileBlobStore;
pub use device_keystore::SoftwareDeviceKeystore;
pub use vault::SoftwareKeyStore;

use crate::config::PromptInfo;
use crate::error::KeyStoreResult;
use crate::session::AuthEventSink;
use crate::types::{
    AttemptId, AuthToken, KeyAlias, KeyDescriptor, KeyHandle, KeyPolicy, OperationId,
    OperationKind,
};

/// Read-only view of the device's biometric capabilities.
///
/// Every call must reflect the current state; enrollment can change between
/// two probes.
pub trait PlatformProbe: Send + Sync {
    /// OS (API) version of the device.
    fn os_version(&self) -> u32;

    /// Whether a biometric sensor is physically present.
    fn has_biometric_hardware(&self) -> bool;

    /// Whether a secure lock screen (PIN, pattern, password) is configured.
    fn is_device_secure(&self) -> bool;

    /// Whether at least one biometric template is enrolled.
    fn has_enrolled_biometrics(&self) -> bool;
}

/// Platform secure key store, addressed only by alias.
///
/// Implementations must never hand raw secret or private key bytes to the
/// caller. Keys generated with `require_user_authentication` may only be used
/// through [`begin`](Self::begin)/[`finish`](Self::finish), and `finish` must
/// refuse any [`AuthToken`] not attested for that exact operation by the
/// biometric subsystem.
pub trait SecureKeyStore: Send + Sync {
    /// Describes the key stored under `alias`, if any.
    ///
    /// # Errors
    /// Returns an error if the store is unavailable or its records are corrupt.
    fn describe(&self, alias: &KeyAlias) -> KeyStoreResult<Option<KeyDescriptor>>;

    /// Generates a new key under `alias`, replacing any existing one.
    ///
    /// # Errors
    /// Returns an error if the store is unavailable or the algorithm is not
    /// supported.
    fn generate(&self, alias: &KeyAlias, policy: &KeyPolicy) -> KeyStoreResult<KeyDescriptor>;

    /// Returns the key under `alias`, generating one with `policy` only if
    /// the alias is empty. Check and generation are one atomic step, so
    /// concurrent callers all observe the same key.
    ///
    /// The existing key is returned whatever its policy; callers compare.
    ///
    /// # Errors
    /// Same as [`generate`](Self::generate).
    fn generate_if_absent(
        &self,
        alias: &KeyAlias,
        policy: &KeyPolicy,
    ) -> KeyStoreResult<KeyDescriptor>;

    /// Deletes the key under `alias`. Returns whether a key existed.
    ///
    /// # Errors
    /// Returns an error if the store is unavailable.
    fn delete(&self, alias: &KeyAlias) -> KeyStoreResult<bool>;

    /// Initializes an operation with the referenced key. The operation is
    /// inert until finished with a matching [`AuthToken`].
    ///
    /// # Errors
    /// Returns [`KeyInvalidated`](crate::KeyStoreError::KeyInvalidated) if the
    /// key was invalidated, `KeyNotFound` if the handle no longer refers to a
    /// stored key.
    fn begin(&self, key: &KeyHandle, kind: &OperationKind) -> KeyStoreResult<OperationId>;

    /// Executes the operation `token` authorizes over `input`, consuming it.
    ///
    /// Encryption returns the IV followed by the ciphertext; decryption the
    /// plaintext; signing a DER encoded ECDSA signature.
    ///
    /// # Errors
    /// Returns `NotAuthorized` for a token that does not verify, in which case
    /// the operation stays pending, and `OperationNotFound` if the operation
    /// was already finished or aborted.
    fn finish(&self, token: &AuthToken, input: &[u8]) -> KeyStoreResult<Vec<u8>>;

    /// Discards an unfinished operation. Unknown ids are ignored.
    fn abort(&self, operation: OperationId);
}

/// One authorization request handed to the biometric service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    /// Attempt this request belongs to; passed back to
    /// [`BiometricService::cancel`].
    pub attempt: AttemptId,
    /// Operation the service must issue an [`AuthToken`] for on success.
    pub operation: OperationId,
    /// Alias of the key being unlocked.
    pub alias: KeyAlias,
    /// Text for the prompt.
    pub prompt: PromptInfo,
}

/// Platform biometric authorization service.
///
/// `authorize` must not block: it shows the prompt and reports sensor events
/// through `events` as they happen, on whatever thread the platform uses.
pub trait BiometricService: Send + Sync {
    /// Starts authorizing `request`, reporting through `events`.
    fn authorize(&self, request: AuthorizationRequest, events: AuthEventSink);

    /// Cancels the prompt for `attempt`. Must tolerate unknown or finished
    /// attempts.
    fn cancel(&self, attempt: AttemptId);
}

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// [`Clock`] backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Device-protected encryption used by the software vault.
///
/// Implementations must use authenticated encryption and include
/// `associated_data` in the tag, so a record sealed for one alias cannot be
/// opened as another.
pub trait DeviceKeystore: Send + Sync {
    /// Seals plaintext under the device-bound key, authenticating
    /// `associated_data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the keystore refuses the operation or the seal fails.
    fn seal(&self, associated_data: &[u8], plaintext: &[u8]) -> KeyStoreResult<Vec<u8>>;

    /// Opens ciphertext under the device-bound key, verifying
    /// `associated_data`.
    ///
    /// # Errors
    ///
    /// Returns an error if authentication fails or the keystore cannot open.
    fn open(&self, associated_data: &[u8], ciphertext: &[u8]) -> KeyStoreResult<Vec<u8>>;
}

/// Atomic blob store for small binary records.
pub trait AtomicBlobStore: Send + Sync {
    /// Reads the blob `name`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn read(&self, name: &str) -> KeyStoreResult<Option<Vec<u8>>>;

    /// Writes bytes atomically to `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn write_atomic(&self, name: &str, bytes: &[u8]) -> KeyStoreResult<()>;

    /// Deletes the blob `name`; missing blobs are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    fn delete(&self, name: &str) -> KeyStoreResult<()>;
}
