//! In-memory implementations of platform traits for testing.
//!
//! [`SimulatedDevice`] and [`ScriptedBiometricService`] stand in for the
//! sensor and the OS prompt; tests flip device state and fire sensor events
//! by hand. [`MemoryPlatform`] wires them to a [`SoftwareKeyStore`] over a
//! [`MemoryBlobStore`].

#![allow(clippy::missing_panics_doc)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::error::KeyStoreResult;
use crate::gate::Platform;
use crate::session::{AuthEventSink, SessionErrorCode};
use crate::types::{AttemptId, AuthToken};

use super::{
    AtomicBlobStore, AuthorizationRequest, BiometricService, Clock, PlatformProbe,
    SoftwareDeviceKeystore, SoftwareKeyStore, TokenAuthority,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Memory Blob Store
// =============================================================================

/// In-memory atomic blob store backed by a `HashMap`.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// Creates a new empty memory blob store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns `true` if no blobs are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the names of all stored blobs.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

impl AtomicBlobStore for MemoryBlobStore {
    fn read(&self, name: &str) -> KeyStoreResult<Option<Vec<u8>>> {
        Ok(self
            .blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned())
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> KeyStoreResult<()> {
        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, name: &str) -> KeyStoreResult<()> {
        self.blobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        Ok(())
    }
}

// =============================================================================
// Manual Clock
// =============================================================================

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `now_ms`.
    #[must_use]
    pub const fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute time.
    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Simulated Device
// =============================================================================

/// Mutable device state behind [`PlatformProbe`].
///
/// Starts as a ready device on OS version 30 with one enrolled biometric.
/// Enrolling a biometric notifies the attached vault so bound keys are
/// invalidated, like a hardware keystore would.
pub struct SimulatedDevice {
    os_version: AtomicU32,
    hardware: AtomicBool,
    secure: AtomicBool,
    enrolled: AtomicU32,
    vault: Mutex<Option<Arc<SoftwareKeyStore>>>,
}

impl SimulatedDevice {
    /// Creates a ready device.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            os_version: AtomicU32::new(30),
            hardware: AtomicBool::new(true),
            secure: AtomicBool::new(true),
            enrolled: AtomicU32::new(1),
            vault: Mutex::new(None),
        }
    }

    /// Routes enrollment changes to `vault`.
    pub fn attach_vault(&self, vault: Arc<SoftwareKeyStore>) {
        *lock(&self.vault) = Some(vault);
    }

    /// Sets the reported OS version.
    pub fn set_os_version(&self, version: u32) {
        self.os_version.store(version, Ordering::SeqCst);
    }

    /// Sets whether a sensor is present.
    pub fn set_hardware(&self, present: bool) {
        self.hardware.store(present, Ordering::SeqCst);
    }

    /// Sets whether a secure lock screen is configured.
    pub fn set_device_secure(&self, secure: bool) {
        self.secure.store(secure, Ordering::SeqCst);
    }

    /// Enrolls one more biometric, invalidating enrollment-bound keys.
    pub fn enroll_biometric(&self) {
        self.enrolled.fetch_add(1, Ordering::SeqCst);
        let vault = lock(&self.vault).clone();
        if let Some(vault) = vault {
            if let Err(err) = vault.on_enrollment_changed() {
                log::error!("failed to record enrollment change: {err}");
            }
        }
    }

    /// Removes every enrolled biometric.
    pub fn remove_biometrics(&self) {
        self.enrolled.store(0, Ordering::SeqCst);
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformProbe for SimulatedDevice {
    fn os_version(&self) -> u32 {
        self.os_version.load(Ordering::SeqCst)
    }

    fn has_biometric_hardware(&self) -> bool {
        self.hardware.load(Ordering::SeqCst)
    }

    fn is_device_secure(&self) -> bool {
        self.secure.load(Ordering::SeqCst)
    }

    fn has_enrolled_biometrics(&self) -> bool {
        self.enrolled.load(Ordering::SeqCst) > 0
    }
}

// =============================================================================
// Scripted Biometric Service
// =============================================================================

/// Sensor behaviour applied as soon as a prompt is shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedResponse {
    /// Authenticate immediately.
    Succeed,
    /// Reject one sample, leaving the prompt up.
    Fail,
    /// End the prompt with an error.
    Error(SessionErrorCode),
}

struct Prompt {
    request: AuthorizationRequest,
    events: Option<AuthEventSink>,
}

/// [`BiometricService`] driven by the test.
///
/// Every prompt is recorded together with its event sink; the test then
/// fires sensor events with [`succeed`](Self::succeed),
/// [`fail`](Self::fail), [`error`](Self::error) or
/// [`dismiss`](Self::dismiss). Cancelling a prompt echoes a `cancelled`
/// event, as platform prompts do. Successes carry tokens minted by the
/// [`TokenAuthority`] shared with the key store.
pub struct ScriptedBiometricService {
    clock: Arc<dyn Clock>,
    authority: Arc<TokenAuthority>,
    prompts: Mutex<Vec<Prompt>>,
    cancelled: Mutex<Vec<AttemptId>>,
    auto_response: Mutex<Option<ScriptedResponse>>,
}

impl ScriptedBiometricService {
    /// Creates a service minting tokens with `authority`, stamped by `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, authority: Arc<TokenAuthority>) -> Self {
        Self {
            clock,
            authority,
            prompts: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            auto_response: Mutex::new(None),
        }
    }

    /// Answers every future prompt with `response` from inside `authorize`.
    pub fn respond_immediately(&self, response: Option<ScriptedResponse>) {
        *lock(&self.auto_response) = response;
    }

    /// Number of prompts shown so far.
    #[must_use]
    pub fn prompt_count(&self) -> usize {
        lock(&self.prompts).len()
    }

    /// The most recent prompt request.
    #[must_use]
    pub fn last_request(&self) -> Option<AuthorizationRequest> {
        lock(&self.prompts).last().map(|prompt| prompt.request.clone())
    }

    /// Attempts the gate asked to cancel.
    #[must_use]
    pub fn cancelled_attempts(&self) -> Vec<AttemptId> {
        lock(&self.cancelled).clone()
    }

    fn token_for(&self, request: &AuthorizationRequest) -> AuthToken {
        self.authority.mint(request.operation, self.clock.now_millis())
    }

    fn latest(&self) -> Option<(AuthorizationRequest, AuthEventSink)> {
        lock(&self.prompts).iter().rev().find_map(|prompt| {
            prompt
                .events
                .clone()
                .map(|events| (prompt.request.clone(), events))
        })
    }

    /// Authenticates the latest open prompt. Returns whether one was open.
    pub fn succeed(&self) -> bool {
        let Some((request, events)) = self.latest() else {
            return false;
        };
        events.succeeded(self.token_for(&request));
        true
    }

    /// Rejects one sample on the latest open prompt.
    pub fn fail(&self) -> bool {
        let Some((_, events)) = self.latest() else {
            return false;
        };
        events.failed();
        true
    }

    /// Ends the latest open prompt with an error.
    pub fn error(&self, code: SessionErrorCode, message: &str) -> bool {
        let Some((_, events)) = self.latest() else {
            return false;
        };
        events.error(code, message);
        true
    }

    /// Reports a raw platform error code on the latest open prompt.
    pub fn platform_error(&self, code: i32, message: &str) -> bool {
        let Some((_, events)) = self.latest() else {
            return false;
        };
        events.platform_error(code, message);
        true
    }

    /// The user dismisses the latest open prompt.
    pub fn dismiss(&self) -> bool {
        let Some((_, events)) = self.latest() else {
            return false;
        };
        events.cancelled();
        true
    }

    /// Reports success on the latest prompt with an arbitrary token, as a
    /// misbehaving service would.
    pub fn succeed_with(&self, token: AuthToken) -> bool {
        let Some((_, events)) = self.latest() else {
            return false;
        };
        events.succeeded(token);
        true
    }

    /// Drops every retained event sink, as a crashed service would.
    pub fn release_all(&self) {
        let sinks: Vec<AuthEventSink> = lock(&self.prompts)
            .iter_mut()
            .filter_map(|prompt| prompt.events.take())
            .collect();
        drop(sinks);
    }
}

impl BiometricService for ScriptedBiometricService {
    fn authorize(&self, request: AuthorizationRequest, events: AuthEventSink) {
        let response = lock(&self.auto_response).clone();
        lock(&self.prompts).push(Prompt {
            request: request.clone(),
            events: Some(events.clone()),
        });
        match response {
            Some(ScriptedResponse::Succeed) => {
                events.succeeded(self.token_for(&request));
            }
            Some(ScriptedResponse::Fail) => events.failed(),
            Some(ScriptedResponse::Error(code)) => events.error(code, "scripted error"),
            None => {}
        }
    }

    fn cancel(&self, attempt: AttemptId) {
        lock(&self.cancelled).push(attempt);
        let events = lock(&self.prompts)
            .iter()
            .find(|prompt| prompt.request.attempt == attempt)
            .and_then(|prompt| prompt.events.clone());
        if let Some(events) = events {
            events.cancelled();
        }
    }
}

// =============================================================================
// Memory Platform Bundle
// =============================================================================

/// Every in-memory implementation wired together.
///
/// # Example
///
/// ```
/// use keygate_core::platform::memory::MemoryPlatform;
/// use keygate_core::{BiometricGate, GateConfig, Readiness};
///
/// let platform = MemoryPlatform::new();
/// let gate = BiometricGate::new(GateConfig::default(), platform.platform()).unwrap();
/// assert!(matches!(gate.readiness(), Readiness::Ready { .. }));
/// ```
pub struct MemoryPlatform {
    /// Simulated sensor and lock screen.
    pub device: Arc<SimulatedDevice>,
    /// Blob store behind the vault.
    pub blob_store: Arc<MemoryBlobStore>,
    /// Software vault.
    pub key_store: Arc<SoftwareKeyStore>,
    /// Scripted prompt.
    pub biometric: Arc<ScriptedBiometricService>,
    /// Manual clock shared by every component.
    pub clock: Arc<ManualClock>,
    /// Token authority shared by the vault and the prompt.
    pub authority: Arc<TokenAuthority>,
}

impl MemoryPlatform {
    /// Creates a ready platform at time 1 000 000 ms.
    #[must_use]
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let blob_store = Arc::new(MemoryBlobStore::new());
        let authority = Arc::new(TokenAuthority::generate());
        let key_store = Arc::new(SoftwareKeyStore::new(
            Arc::new(SoftwareDeviceKeystore::generate()),
            blob_store.clone(),
            clock.clone(),
            Arc::clone(&authority),
        ));
        let device = Arc::new(SimulatedDevice::new());
        device.attach_vault(Arc::clone(&key_store));
        Self {
            device,
            blob_store,
            key_store,
            biometric: Arc::new(ScriptedBiometricService::new(
                clock.clone(),
                Arc::clone(&authority),
            )),
            clock,
            authority,
        }
    }

    /// The platform bundle a [`BiometricGate`](crate::BiometricGate) consumes.
    #[must_use]
    pub fn platform(&self) -> Platform {
        Platform {
            probe: self.device.clone(),
            key_store: self.key_store.clone(),
            biometric: self.biometric.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl Default for MemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}
