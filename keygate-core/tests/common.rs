//! Common test utilities shared across integration tests.

use std::path::Path;
use std::sync::{Arc, Mutex};

use keygate_core::platform::memory::{
    ManualClock, MemoryPlatform, ScriptedBiometricService, SimulatedDevice,
};
use keygate_core::platform::{
    FileBlobStore, SoftwareDeviceKeystore, SoftwareKeyStore, TokenAuthority,
};
use keygate_core::{BiometricGate, GateConfig, Platform, ReplayGuard, SessionOutcome};

pub type Outcomes = Arc<Mutex<Vec<SessionOutcome>>>;

/// Records every outcome delivered to the returned callback.
pub fn recorder() -> (Outcomes, impl FnMut(SessionOutcome) + Send + 'static) {
    let outcomes: Outcomes = Arc::default();
    let sink = Arc::clone(&outcomes);
    (outcomes, move |outcome| {
        sink.lock().expect("outcomes").push(outcome);
    })
}

pub struct Harness {
    pub platform: MemoryPlatform,
    pub gate: BiometricGate,
    pub nonces: Arc<ReplayGuard>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(GateConfig::default())
    }

    pub fn with_config(config: GateConfig) -> Self {
        let platform = MemoryPlatform::new();
        let nonces = Arc::new(ReplayGuard::from_config(platform.clock.clone(), &config));
        let gate = BiometricGate::new(config, platform.platform()).expect("gate");
        Self {
            platform,
            gate,
            nonces,
        }
    }
}

/// A device whose vault persists under `dir` and is sealed with `device_key`.
#[allow(dead_code, reason = "used in tests")]
pub struct FileDevice {
    pub device: Arc<SimulatedDevice>,
    pub key_store: Arc<SoftwareKeyStore>,
    pub biometric: Arc<ScriptedBiometricService>,
    pub clock: Arc<ManualClock>,
}

#[allow(dead_code, reason = "used in tests")]
impl FileDevice {
    pub fn open(dir: &Path, device_key: [u8; 32]) -> Self {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let authority = Arc::new(TokenAuthority::generate());
        let key_store = Arc::new(SoftwareKeyStore::new(
            Arc::new(SoftwareDeviceKeystore::from_key(device_key)),
            Arc::new(FileBlobStore::new(dir).expect("blob store")),
            clock.clone(),
            Arc::clone(&authority),
        ));
        let device = Arc::new(SimulatedDevice::new());
        device.attach_vault(Arc::clone(&key_store));
        Self {
            device,
            key_store,
            biometric: Arc::new(ScriptedBiometricService::new(clock.clone(), authority)),
            clock,
        }
    }

    pub fn platform(&self) -> Platform {
        Platform {
            probe: self.device.clone(),
            key_store: self.key_store.clone(),
            biometric: self.biometric.clone(),
            clock: self.clock.clone(),
        }
    }
}
