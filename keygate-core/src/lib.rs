//! Biometric-gated, device-bound keys.
//!
//! A [`BiometricGate`] walks the whole flow: probe the device
//! ([`CapabilityProber`]), make sure a key exists under the configured alias
//! ([`KeyManager`]), build a one-time [`Challenge`], bind the key into an inert
//! [`Operation`] ([`OperationBinder`]) and hand it to an authentication session
//! ([`SessionLauncher`]) that executes it only after the platform biometric
//! prompt succeeds.
//!
//! Every platform dependency is a trait in [`platform`]; hosts without a
//! secure element can use the [`SoftwareKeyStore`](platform::SoftwareKeyStore)
//! vault, and tests use [`platform::memory`].

mod capability;
pub use capability::*;

mod challenge;
pub use challenge::*;

mod config;
pub use config::*;

mod error;
pub use error::*;

mod gate;
pub use gate::*;

mod keys;
pub use keys::*;

mod operation;
pub use operation::*;

pub mod session;
pub use session::*;

mod types;
pub use types::*;

pub mod logger;
pub mod platform;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!("keygate_core");
