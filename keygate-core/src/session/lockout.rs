use std::sync::{Arc, Mutex, PoisonError};

use crate::platform::Clock;

use super::outcome::{Retryability, SessionError, SessionErrorCode};

#[derive(Debug, Default, Clone, Copy)]
struct LockoutState {
    until_ms: Option<u64>,
    permanent: bool,
}

/// Sensor lockout state shared by every session launched from one gate.
///
/// A `Lockout` error starts a cooldown; until it elapses new sessions end
/// with `Error(Lockout)` without reaching the biometric service. A permanent
/// lockout holds until [`clear`](Self::clear) is called, typically after the
/// user unlocked with the device credential.
pub struct LockoutTracker {
    clock: Arc<dyn Clock>,
    cooldown_ms: u64,
    state: Mutex<LockoutState>,
}

impl LockoutTracker {
    /// Creates an unlocked tracker.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, cooldown_ms: u64) -> Self {
        Self {
            clock,
            cooldown_ms,
            state: Mutex::new(LockoutState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LockoutState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a lockout reported by the platform.
    pub fn record(&self, code: SessionErrorCode) {
        let mut state = self.state();
        match code {
            SessionErrorCode::Lockout => {
                let until = self.clock.now_millis().saturating_add(self.cooldown_ms);
                state.until_ms = Some(state.until_ms.map_or(until, |current| current.max(until)));
                log::warn!("biometric sensor locked out for {} ms", self.cooldown_ms);
            }
            SessionErrorCode::LockoutPermanent => {
                state.permanent = true;
                log::warn!("biometric sensor locked out until device credential unlock");
            }
            _ => {}
        }
    }

    /// Milliseconds left in the current cooldown, if any.
    #[must_use]
    pub fn remaining_ms(&self) -> Option<u64> {
        let now = self.clock.now_millis();
        self.state()
            .until_ms
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Whether sessions are currently blocked.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.check().is_some()
    }

    /// Returns the error a new session must end with while locked out.
    #[must_use]
    pub fn check(&self) -> Option<SessionError> {
        if self.state().permanent {
            return Some(SessionError::new(
                SessionErrorCode::LockoutPermanent,
                "biometric sensor locked, unlock with the device credential",
                Retryability::AfterUserAction,
            ));
        }
        self.remaining_ms().map(|remaining| {
            SessionError::new(
                SessionErrorCode::Lockout,
                format!("biometric sensor locked, retry in {remaining} ms"),
                Retryability::AfterCooldown {
                    cooldown_ms: remaining,
                },
            )
        })
    }

    /// Lifts any lockout.
    pub fn clear(&self) {
        *self.state() = LockoutState::default();
        log::info!("biometric lockout cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::memory::ManualClock;

    #[test]
    fn test_cooldown_expires() {
        let clock = Arc::new(ManualClock::new(10_000));
        let tracker = LockoutTracker::new(clock.clone(), 30_000);
        assert!(tracker.check().is_none());

        tracker.record(SessionErrorCode::Lockout);
        let err = tracker.check().expect("locked");
        assert_eq!(err.code, SessionErrorCode::Lockout);
        assert_eq!(err.retry, Retryability::AfterCooldown { cooldown_ms: 30_000 });

        clock.advance(29_999);
        assert_eq!(tracker.remaining_ms(), Some(1));
        clock.advance(1);
        assert!(!tracker.is_locked());
    }

    #[test]
    fn test_permanent_until_cleared() {
        let clock = Arc::new(ManualClock::new(0));
        let tracker = LockoutTracker::new(clock.clone(), 1_000);
        tracker.record(SessionErrorCode::LockoutPermanent);
        clock.advance(1_000_000);
        assert_eq!(
            tracker.check().expect("locked").code,
            SessionErrorCode::LockoutPermanent
        );
        tracker.clear();
        assert!(tracker.check().is_none());
    }

    #[test]
    fn test_other_codes_ignored() {
        let tracker = LockoutTracker::new(Arc::new(ManualClock::new(0)), 1_000);
        tracker.record(SessionErrorCode::Timeout);
        assert!(!tracker.is_locked());
    }
}
