//! Device readiness classification.

use std::sync::Arc;

use crate::config::ProbeThresholds;
use crate::error::CapabilityError;
use crate::platform::PlatformProbe;

/// Why the device can never authenticate as it stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum UnsupportedReason {
    /// The OS predates biometric APIs.
    OsTooOld {
        /// Reported OS version.
        found: u32,
        /// First version with biometric APIs.
        required: u32,
    },
    /// No sensor is present.
    NoHardware,
}

/// Which flavour of biometric gate the platform offers.
///
/// Chosen once at probe time so the rest of the flow never branches on OS
/// versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum AuthPath {
    /// The prompt authorizes a symmetric cipher (older platforms).
    CipherGated,
    /// The prompt authorizes an ECDSA signature over a challenge.
    SignatureGated,
}

/// Result of [`CapabilityProber::probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum Readiness {
    /// Biometric authentication is impossible on this device.
    Unsupported {
        /// What is missing.
        reason: UnsupportedReason,
    },
    /// No secure lock screen is configured.
    LockscreenNotSecure,
    /// No biometric is enrolled.
    NoEnrolledBiometric,
    /// Ready to authenticate along `path`.
    Ready {
        /// Gate flavour to use.
        path: AuthPath,
    },
}

impl Readiness {
    /// Whether the device can authenticate now.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    /// Returns the auth path, or the capability error blocking it.
    ///
    /// # Errors
    /// Returns the [`CapabilityError`] matching a non-ready state.
    pub const fn require(self) -> Result<AuthPath, CapabilityError> {
        match self {
            Self::Ready { path } => Ok(path),
            Self::Unsupported {
                reason: UnsupportedReason::OsTooOld { found, required },
            } => Err(CapabilityError::UnsupportedOs { found, required }),
            Self::Unsupported {
                reason: UnsupportedReason::NoHardware,
            } => Err(CapabilityError::NoHardware),
            Self::LockscreenNotSecure => Err(CapabilityError::LockscreenNotSecure),
            Self::NoEnrolledBiometric => Err(CapabilityError::NoEnrolledBiometric),
        }
    }
}

/// Classifies device readiness from a [`PlatformProbe`].
#[derive(Clone)]
pub struct CapabilityProber {
    probe: Arc<dyn PlatformProbe>,
    thresholds: ProbeThresholds,
}

impl CapabilityProber {
    /// Creates a prober with the given version thresholds.
    #[must_use]
    pub fn new(probe: Arc<dyn PlatformProbe>, thresholds: ProbeThresholds) -> Self {
        Self { probe, thresholds }
    }

    /// Queries the platform afresh and returns the first failing condition,
    /// checked in order: OS version, sensor, lock screen, enrollment.
    #[must_use]
    pub fn probe(&self) -> Readiness {
        let os_version = self.probe.os_version();
        let readiness = if os_version < self.thresholds.min_biometric_os_version {
            Readiness::Unsupported {
                reason: UnsupportedReason::OsTooOld {
                    found: os_version,
                    required: self.thresholds.min_biometric_os_version,
                },
            }
        } else if !self.probe.has_biometric_hardware() {
            Readiness::Unsupported {
                reason: UnsupportedReason::NoHardware,
            }
        } else if !self.probe.is_device_secure() {
            Readiness::LockscreenNotSecure
        } else if !self.probe.has_enrolled_biometrics() {
            Readiness::NoEnrolledBiometric
        } else if os_version >= self.thresholds.signature_prompt_os_version {
            Readiness::Ready {
                path: AuthPath::SignatureGated,
            }
        } else {
            Readiness::Ready {
                path: AuthPath::CipherGated,
            }
        };
        log::debug!("probed readiness on os version {os_version}: {readiness:?}");
        readiness
    }
}
