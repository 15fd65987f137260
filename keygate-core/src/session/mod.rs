//! Authentication session state machine.
//!
//! One call to [`SessionLauncher::start`] drives one biometric attempt:
//!
//! ```text
//! Idle -> Submitted -> { Succeeded, Error, Cancelled }
//!            ^  |
//!            +--+ Failed (bad sample, same operation)
//! ```
//!
//! The outcome callback fires exactly once with a terminal outcome per
//! `start`, plus once per `Failed` cycle. Outcomes are queued and delivered by
//! a single drainer, so callbacks never run concurrently even when the
//! platform reports events from several threads.
//!
//! Only one session per key alias may be in flight; a second `start` for the
//! same alias fails with [`KeyGateError::SessionBusy`].

mod lockout;
mod outcome;
mod pending;
mod state;

use std::fmt;
use std::sync::Arc;

use zeroize::Zeroizing;

pub use self::state::{AuthEventSink, CancelHandle};
pub use lockout::LockoutTracker;
pub use outcome::{Proof, Retryability, SessionError, SessionErrorCode, SessionOutcome};
pub use pending::{FailedObserver, PendingOutcome};

use self::state::{InFlight, OutcomeCallback, SessionCore};
use crate::challenge::Challenge;
use crate::config::PromptInfo;
use crate::error::KeyGateError;
use crate::operation::Operation;
use crate::platform::{AuthorizationRequest, BiometricService};
use crate::types::{AttemptId, OperationKind};

/// A bound operation paired with the input it will run over once authorized.
pub struct AuthRequest {
    operation: Operation,
    input: Zeroizing<Vec<u8>>,
    prompt: Option<PromptInfo>,
}

impl AuthRequest {
    /// Signs the encoded `challenge` once authorized.
    ///
    /// # Errors
    /// Returns [`KeyGateError::InvalidInput`] if `operation` is not a signing
    /// operation or `challenge` was not built for its key.
    pub fn sign(operation: Operation, challenge: &Challenge) -> Result<Self, KeyGateError> {
        if operation.kind() != OperationKind::Sign {
            return Err(KeyGateError::invalid_input(
                "operation",
                "a challenge can only be signed by a signing operation",
            ));
        }
        if challenge.alias() != operation.alias() {
            return Err(KeyGateError::invalid_input(
                "challenge",
                format!("built for `{}`, not `{}`", challenge.alias(), operation.alias()),
            ));
        }
        Ok(Self::new(operation, challenge.to_bytes()))
    }

    /// Encrypts `payload` once authorized.
    ///
    /// # Errors
    /// Returns [`KeyGateError::InvalidInput`] for a non-encrypting operation.
    pub fn encrypt(operation: Operation, payload: &[u8]) -> Result<Self, KeyGateError> {
        if operation.kind() != OperationKind::Encrypt {
            return Err(KeyGateError::invalid_input(
                "operation",
                "payloads can only be encrypted by an encrypting operation",
            ));
        }
        Ok(Self::new(operation, payload.to_vec()))
    }

    /// Decrypts `ciphertext` once authorized.
    ///
    /// # Errors
    /// Returns [`KeyGateError::InvalidInput`] for a non-decrypting operation or
    /// a ciphertext that is not a whole number of AES blocks.
    pub fn decrypt(operation: Operation, ciphertext: &[u8]) -> Result<Self, KeyGateError> {
        if !matches!(operation.kind(), OperationKind::Decrypt { .. }) {
            return Err(KeyGateError::invalid_input(
                "operation",
                "ciphertexts can only be decrypted by a decrypting operation",
            ));
        }
        if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
            return Err(KeyGateError::invalid_input(
                "ciphertext",
                "must be a non-empty multiple of the AES block size",
            ));
        }
        Ok(Self::new(operation, ciphertext.to_vec()))
    }

    fn new(operation: Operation, input: Vec<u8>) -> Self {
        Self {
            operation,
            input: Zeroizing::new(input),
            prompt: None,
        }
    }

    /// Overrides the prompt text for this request.
    #[must_use]
    pub fn with_prompt(mut self, prompt: PromptInfo) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// The bound operation.
    #[must_use]
    pub const fn operation(&self) -> &Operation {
        &self.operation
    }
}

impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRequest")
            .field("operation", &self.operation)
            .field("input_len", &self.input.len())
            .field("prompt", &self.prompt)
            .finish()
    }
}

/// Starts authentication sessions against one biometric service.
#[derive(Clone)]
pub struct SessionLauncher {
    biometric: Arc<dyn BiometricService>,
    lockout: Arc<LockoutTracker>,
    in_flight: Arc<InFlight>,
    default_prompt: PromptInfo,
}

impl SessionLauncher {
    /// Creates a launcher; every session it starts shares `lockout`.
    #[must_use]
    pub fn new(
        biometric: Arc<dyn BiometricService>,
        lockout: Arc<LockoutTracker>,
        default_prompt: PromptInfo,
    ) -> Self {
        Self {
            biometric,
            lockout,
            in_flight: Arc::new(InFlight::default()),
            default_prompt,
        }
    }

    /// Lockout state shared by this launcher's sessions.
    #[must_use]
    pub fn lockout(&self) -> &LockoutTracker {
        &self.lockout
    }

    /// Submits `request` for biometric authorization.
    ///
    /// Outcomes are delivered through `on_outcome`, never returned. While the
    /// sensor is locked out the session ends immediately with
    /// `Error(Lockout)` and the biometric service is not consulted.
    ///
    /// # Errors
    /// Returns [`KeyGateError::SessionBusy`] if a session for the same alias
    /// is still in flight.
    pub fn start<F>(
        &self,
        request: AuthRequest,
        on_outcome: F,
    ) -> Result<CancelHandle, KeyGateError>
    where
        F: FnMut(SessionOutcome) + Send + 'static,
    {
        self.launch(request, Box::new(on_outcome))
    }

    /// Submits `request` and returns a future for its terminal outcome.
    ///
    /// # Errors
    /// Same as [`start`](Self::start).
    pub fn authenticate(
        &self,
        request: AuthRequest,
        on_failed: Option<FailedObserver>,
    ) -> Result<(CancelHandle, PendingOutcome), KeyGateError> {
        let (callback, pending) = pending::channel(on_failed);
        let handle = self.launch(request, callback)?;
        Ok((handle, pending))
    }

    fn launch(
        &self,
        request: AuthRequest,
        mut callback: OutcomeCallback,
    ) -> Result<CancelHandle, KeyGateError> {
        let AuthRequest {
            operation,
            input,
            prompt,
        } = request;

        if let Some(locked) = self.lockout.check() {
            log::warn!(
                "refusing session for `{}` while locked out",
                operation.alias()
            );
            drop(operation);
            callback(SessionOutcome::Error(locked));
            return Ok(CancelHandle::finished());
        }

        let claim = self
            .in_flight
            .try_claim(operation.alias())
            .ok_or_else(|| KeyGateError::SessionBusy {
                alias: operation.alias().clone(),
            })?;

        let authorization = AuthorizationRequest {
            attempt: AttemptId::generate(),
            operation: operation.id(),
            alias: operation.alias().clone(),
            prompt: prompt.unwrap_or_else(|| self.default_prompt.clone()),
        };
        let core = Arc::new(SessionCore::new(
            authorization.attempt,
            operation,
            input,
            claim,
            Arc::clone(&self.biometric),
            Arc::clone(&self.lockout),
            callback,
        ));
        core.mark_submitted();
        log::debug!(
            "attempt {} submitted for `{}`",
            authorization.attempt,
            authorization.alias
        );
        self.biometric
            .authorize(authorization, AuthEventSink::new(Arc::clone(&core)));
        Ok(CancelHandle::new(core))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::platform::memory::{MemoryPlatform, ScriptedResponse};
    use crate::platform::SecureKeyStore;
    use crate::types::{AuthToken, OperationId};
    use crate::{BiometricGate, GateConfig, ReplayGuard};

    type Outcomes = Arc<Mutex<Vec<SessionOutcome>>>;

    fn recorder() -> (Outcomes, impl FnMut(SessionOutcome) + Send + 'static) {
        let outcomes: Outcomes = Arc::default();
        let sink = Arc::clone(&outcomes);
        (outcomes, move |outcome| sink.lock().unwrap().push(outcome))
    }

    fn setup() -> (MemoryPlatform, BiometricGate, ReplayGuard) {
        let platform = MemoryPlatform::new();
        let gate = BiometricGate::new(GateConfig::default(), platform.platform()).unwrap();
        let nonces = ReplayGuard::new(platform.clock.clone(), 60_000);
        (platform, gate, nonces)
    }

    fn terminal_count(outcomes: &Outcomes) -> usize {
        outcomes
            .lock()
            .unwrap()
            .iter()
            .filter(|outcome| outcome.is_terminal())
            .count()
    }

    #[test]
    fn test_failed_repeats_then_success() {
        let (platform, gate, nonces) = setup();
        let (outcomes, callback) = recorder();
        gate.start(gate.prepare_signature(&nonces).unwrap(), callback)
            .unwrap();

        assert!(platform.biometric.fail());
        assert!(platform.biometric.fail());
        assert!(platform.biometric.succeed());
        assert!(platform.biometric.succeed());

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(matches!(outcomes[0], SessionOutcome::Failed));
        assert!(matches!(outcomes[1], SessionOutcome::Failed));
        assert!(matches!(
            outcomes[2],
            SessionOutcome::Authenticated(Proof::Signature { .. })
        ));
    }

    #[test]
    fn test_events_after_terminal_ignored() {
        let (platform, gate, nonces) = setup();
        let (outcomes, callback) = recorder();
        let handle = gate
            .start(gate.prepare_signature(&nonces).unwrap(), callback)
            .unwrap();

        platform
            .biometric
            .error(SessionErrorCode::HardwareUnavailable, "sensor busy");
        platform.biometric.succeed();
        platform.biometric.fail();
        platform.biometric.dismiss();
        handle.cancel();

        assert_eq!(outcomes.lock().unwrap().len(), 1);
        assert!(handle.is_finished());
        assert!(platform.biometric.cancelled_attempts().is_empty());
    }

    #[test]
    fn test_second_session_for_alias_is_busy() {
        let (platform, gate, nonces) = setup();
        let (_outcomes, callback) = recorder();
        let first = gate
            .start(gate.prepare_signature(&nonces).unwrap(), callback)
            .unwrap();

        let (second_outcomes, callback) = recorder();
        let err = gate
            .start(gate.prepare_signature(&nonces).unwrap(), callback)
            .unwrap_err();
        assert!(matches!(err, KeyGateError::SessionBusy { .. }));
        assert!(second_outcomes.lock().unwrap().is_empty());
        assert_eq!(platform.biometric.prompt_count(), 1);

        // a different alias is independent
        let (_cipher, callback) = recorder();
        assert!(gate
            .start(gate.prepare_encryption(b"data").unwrap(), callback)
            .is_ok());

        first.cancel();
        let (_again, callback) = recorder();
        assert!(gate
            .start(gate.prepare_signature(&nonces).unwrap(), callback)
            .is_ok());
    }

    #[test]
    fn test_cancel_from_inside_callback() {
        let (platform, gate, nonces) = setup();
        let handle_slot: Arc<Mutex<Option<CancelHandle>>> = Arc::default();
        let outcomes: Outcomes = Arc::default();
        let (slot, sink) = (Arc::clone(&handle_slot), Arc::clone(&outcomes));
        let handle = gate
            .start(gate.prepare_signature(&nonces).unwrap(), move |outcome| {
                let failed = matches!(outcome, SessionOutcome::Failed);
                sink.lock().unwrap().push(outcome);
                if failed {
                    if let Some(handle) = slot.lock().unwrap().as_ref() {
                        handle.cancel();
                    }
                }
            })
            .unwrap();
        *handle_slot.lock().unwrap() = Some(handle);

        platform.biometric.fail();

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[1], SessionOutcome::Cancelled));
    }

    #[test]
    fn test_immediate_response_inside_authorize() {
        let (platform, gate, nonces) = setup();
        platform
            .biometric
            .respond_immediately(Some(ScriptedResponse::Succeed));
        let (outcomes, callback) = recorder();
        let handle = gate
            .start(gate.prepare_signature(&nonces).unwrap(), callback)
            .unwrap();
        assert!(handle.is_finished());
        assert_eq!(terminal_count(&outcomes), 1);
    }

    #[test]
    fn test_released_sink_abandons_session() {
        let (platform, gate, nonces) = setup();
        let (outcomes, callback) = recorder();
        gate.start(gate.prepare_signature(&nonces).unwrap(), callback)
            .unwrap();
        platform.biometric.release_all();

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(
            &outcomes[0],
            SessionOutcome::Error(SessionError {
                code: SessionErrorCode::Abandoned,
                ..
            })
        ));
    }

    #[test]
    fn test_token_for_other_operation_not_accepted() {
        let (platform, gate, nonces) = setup();
        let (outcomes, callback) = recorder();
        gate.start(gate.prepare_signature(&nonces).unwrap(), callback)
            .unwrap();
        platform
            .biometric
            .succeed_with(platform.authority.mint(OperationId::generate(), 0));

        let outcomes = outcomes.lock().unwrap();
        assert!(matches!(
            &outcomes[0],
            SessionOutcome::Error(SessionError {
                code: SessionErrorCode::OperationFailed,
                ..
            })
        ));
    }

    #[test]
    fn test_key_invalidated_while_prompting() {
        let (platform, gate, nonces) = setup();
        let (outcomes, callback) = recorder();
        gate.start(gate.prepare_signature(&nonces).unwrap(), callback)
            .unwrap();
        platform.device.enroll_biometric();
        platform.biometric.succeed();

        let outcomes = outcomes.lock().unwrap();
        assert!(matches!(
            &outcomes[0],
            SessionOutcome::Error(SessionError {
                code: SessionErrorCode::KeyInvalidated,
                ..
            })
        ));
    }

    #[test]
    fn test_cancel_aborts_operation() {
        let (platform, gate, nonces) = setup();
        let request = gate.prepare_signature(&nonces).unwrap();
        let operation = request.operation().id();
        let (_outcomes, callback) = recorder();
        gate.start(request, callback).unwrap().cancel();
        assert!(platform
            .key_store
            .finish(&platform.authority.mint(operation, 0), b"m")
            .is_err());
    }

    #[test]
    fn test_forged_token_on_success_fails_session() {
        let (platform, gate, nonces) = setup();
        let request = gate.prepare_signature(&nonces).unwrap();
        let operation = request.operation().id();
        let (outcomes, callback) = recorder();
        gate.start(request, callback).unwrap();
        platform
            .biometric
            .succeed_with(AuthToken::new(operation, 0, vec![0; 32]));

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(
            &outcomes[0],
            SessionOutcome::Error(SessionError {
                code: SessionErrorCode::OperationFailed,
                ..
            })
        ));
    }

    #[test]
    fn test_outcomes_never_overlap() {
        let (platform, gate, nonces) = setup();
        let active = Arc::new(Mutex::new(false));
        let overlaps = Arc::new(Mutex::new(0usize));
        let (flag, count) = (Arc::clone(&active), Arc::clone(&overlaps));
        gate.start(gate.prepare_signature(&nonces).unwrap(), move |_| {
            {
                let mut active = flag.lock().unwrap();
                if *active {
                    *count.lock().unwrap() += 1;
                }
                *active = true;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
            *flag.lock().unwrap() = false;
        })
        .unwrap();

        let biometric = Arc::clone(&platform.biometric);
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let biometric = Arc::clone(&biometric);
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        biometric.fail();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(*overlaps.lock().unwrap(), 0);
    }

    #[test]
    fn test_no_failed_after_terminal_under_races() {
        for _ in 0..20 {
            let (platform, gate, nonces) = setup();
            let (outcomes, callback) = recorder();
            gate.start(gate.prepare_signature(&nonces).unwrap(), callback)
                .unwrap();

            let barrier = Arc::new(std::sync::Barrier::new(5));
            let mut threads: Vec<_> = (0..4)
                .map(|_| {
                    let biometric = Arc::clone(&platform.biometric);
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        for _ in 0..20 {
                            biometric.fail();
                        }
                    })
                })
                .collect();
            let biometric = Arc::clone(&platform.biometric);
            let ready = Arc::clone(&barrier);
            threads.push(std::thread::spawn(move || {
                ready.wait();
                biometric.succeed();
            }));
            for thread in threads {
                thread.join().unwrap();
            }

            assert_eq!(terminal_count(&outcomes), 1);
            let outcomes = outcomes.lock().unwrap();
            assert!(outcomes.last().is_some_and(SessionOutcome::is_terminal));
        }
    }

    #[tokio::test]
    async fn test_authenticate_resolves_on_terminal() {
        let (platform, gate, nonces) = setup();
        let failures = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&failures);
        let observer: FailedObserver = Arc::new(move || *counter.lock().unwrap() += 1);
        let (_handle, pending) = gate
            .authenticate(gate.prepare_encryption(b"secret").unwrap(), Some(observer))
            .unwrap();

        platform.biometric.fail();
        platform.biometric.succeed();

        match pending.await {
            SessionOutcome::Authenticated(Proof::Ciphertext { ciphertext, .. }) => {
                assert_eq!(ciphertext.len(), 16);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(*failures.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_authenticate_cancelled() {
        let (_platform, gate, nonces) = setup();
        let (handle, pending) = gate
            .authenticate(gate.prepare_signature(&nonces).unwrap(), None)
            .unwrap();
        handle.cancel();
        assert!(matches!(pending.await, SessionOutcome::Cancelled));
    }
}
