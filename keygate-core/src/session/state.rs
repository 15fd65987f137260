use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use zeroize::Zeroizing;

use crate::error::KeyStoreError;
use crate::operation::Operation;
use crate::platform::BiometricService;
use crate::types::{AttemptId, AuthToken, KeyAlias};

use super::lockout::LockoutTracker;
use super::outcome::{Retryability, SessionError, SessionErrorCode, SessionOutcome};

pub(crate) type OutcomeCallback = Box<dyn FnMut(SessionOutcome) + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Aliases with a session in flight.
#[derive(Default)]
pub(crate) struct InFlight {
    aliases: Mutex<HashSet<KeyAlias>>,
}

impl InFlight {
    pub(crate) fn try_claim(self: &Arc<Self>, alias: &KeyAlias) -> Option<AliasClaim> {
        lock(&self.aliases).insert(alias.clone()).then(|| AliasClaim {
            registry: Arc::clone(self),
            alias: alias.clone(),
        })
    }
}

/// Marks an alias busy until dropped.
pub(crate) struct AliasClaim {
    registry: Arc<InFlight>,
    alias: KeyAlias,
}

impl Drop for AliasClaim {
    fn drop(&mut self) {
        lock(&self.registry.aliases).remove(&self.alias);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Submitted,
    Succeeded,
    Errored,
    Cancelled,
}

struct Attempt {
    phase: Phase,
    operation: Option<Operation>,
    input: Zeroizing<Vec<u8>>,
    claim: Option<AliasClaim>,
}

impl Attempt {
    /// Moves to a terminal phase, releasing the alias. Returns the operation
    /// if this call performed the transition.
    fn terminate(&mut self, phase: Phase) -> Option<Option<Operation>> {
        if self.phase != Phase::Submitted {
            return None;
        }
        self.phase = phase;
        self.claim = None;
        Some(self.operation.take())
    }
}

#[derive(Default)]
struct Delivery {
    queue: VecDeque<SessionOutcome>,
    draining: bool,
    callback: Option<OutcomeCallback>,
}

/// Shared state of one `start` call.
pub(crate) struct SessionCore {
    attempt_id: AttemptId,
    alias: KeyAlias,
    biometric: Arc<dyn BiometricService>,
    lockout: Arc<LockoutTracker>,
    attempt: Mutex<Attempt>,
    delivery: Mutex<Delivery>,
}

impl SessionCore {
    pub(crate) fn new(
        attempt_id: AttemptId,
        operation: Operation,
        input: Zeroizing<Vec<u8>>,
        claim: AliasClaim,
        biometric: Arc<dyn BiometricService>,
        lockout: Arc<LockoutTracker>,
        callback: OutcomeCallback,
    ) -> Self {
        Self {
            attempt_id,
            alias: operation.alias().clone(),
            biometric,
            lockout,
            attempt: Mutex::new(Attempt {
                phase: Phase::Idle,
                operation: Some(operation),
                input,
                claim: Some(claim),
            }),
            delivery: Mutex::new(Delivery {
                callback: Some(callback),
                ..Delivery::default()
            }),
        }
    }

    pub(crate) const fn attempt_id(&self) -> AttemptId {
        self.attempt_id
    }

    pub(crate) fn mark_submitted(&self) {
        let mut attempt = lock(&self.attempt);
        if attempt.phase == Phase::Idle {
            attempt.phase = Phase::Submitted;
        }
    }

    fn is_finished(&self) -> bool {
        !matches!(lock(&self.attempt).phase, Phase::Idle | Phase::Submitted)
    }

    fn enqueue(&self, outcome: SessionOutcome) {
        lock(&self.delivery).queue.push_back(outcome);
    }

    /// Queues an outcome and drains the queue unless another caller already
    /// is. Callbacks therefore never overlap, and an event raised from inside
    /// the callback is delivered after it returns.
    fn deliver(&self, outcome: SessionOutcome) {
        self.enqueue(outcome);
        self.drain();
    }

    fn drain(&self) {
        let mut delivery = lock(&self.delivery);
        if delivery.draining {
            return;
        }
        delivery.draining = true;
        while let Some(next) = delivery.queue.pop_front() {
            let Some(mut callback) = delivery.callback.take() else {
                delivery.queue.clear();
                break;
            };
            drop(delivery);
            callback(next);
            delivery = lock(&self.delivery);
            delivery.callback = Some(callback);
        }
        delivery.draining = false;
    }

    #[allow(
        clippy::significant_drop_tightening,
        reason = "the attempt lock orders Failed before any terminal outcome"
    )]
    fn on_failed(&self) {
        {
            // Queued under the attempt lock so a racing terminal event is
            // always queued after it.
            let attempt = lock(&self.attempt);
            if attempt.phase != Phase::Submitted {
                log::debug!("ignoring failed sample for finished attempt {}", self.attempt_id);
                return;
            }
            self.enqueue(SessionOutcome::Failed);
        }
        log::debug!("biometric sample rejected for attempt {}", self.attempt_id);
        self.drain();
    }

    fn on_succeeded(&self, token: &AuthToken) {
        let (operation, input) = {
            let mut attempt = lock(&self.attempt);
            let Some(operation) = attempt.terminate(Phase::Succeeded) else {
                log::warn!("ignoring duplicate success for attempt {}", self.attempt_id);
                return;
            };
            (operation, std::mem::take(&mut attempt.input))
        };
        let outcome = match operation {
            Some(operation) => match operation.execute(token, &input) {
                Ok(proof) => {
                    log::info!("attempt {} authenticated `{}`", self.attempt_id, self.alias);
                    SessionOutcome::Authenticated(proof)
                }
                Err(err) => {
                    log::warn!("authorized operation on `{}` failed: {err}", self.alias);
                    let code = match err {
                        KeyStoreError::KeyInvalidated { .. } => SessionErrorCode::KeyInvalidated,
                        _ => SessionErrorCode::OperationFailed,
                    };
                    SessionOutcome::Error(SessionError::new(
                        code,
                        err.to_string(),
                        code.retryability(0),
                    ))
                }
            },
            None => SessionOutcome::Error(SessionError::new(
                SessionErrorCode::OperationFailed,
                "operation already consumed",
                Retryability::Never,
            )),
        };
        self.deliver(outcome);
    }

    fn on_error(&self, code: SessionErrorCode, message: String) {
        if lock(&self.attempt).terminate(Phase::Errored).is_none() {
            log::debug!("ignoring {code} for finished attempt {}", self.attempt_id);
            return;
        }
        log::warn!("attempt {} on `{}` ended with {code}: {message}", self.attempt_id, self.alias);
        self.lockout.record(code);
        let retry = match self.lockout.check() {
            Some(locked) if locked.code == code => locked.retry,
            _ => code.retryability(0),
        };
        self.deliver(SessionOutcome::Error(SessionError::new(code, message, retry)));
    }

    fn on_cancelled(&self) {
        if lock(&self.attempt).terminate(Phase::Cancelled).is_none() {
            return;
        }
        log::info!("attempt {} cancelled by the platform", self.attempt_id);
        self.deliver(SessionOutcome::Cancelled);
    }

    fn on_events_dropped(&self) {
        if lock(&self.attempt).terminate(Phase::Errored).is_none() {
            return;
        }
        log::warn!("biometric service dropped attempt {} without an outcome", self.attempt_id);
        self.deliver(SessionOutcome::Error(SessionError::new(
            SessionErrorCode::Abandoned,
            "biometric service released the session without an outcome",
            Retryability::AfterUserAction,
        )));
    }

    fn cancel(&self) {
        if lock(&self.attempt).terminate(Phase::Cancelled).is_none() {
            return;
        }
        log::info!("attempt {} cancelled by the caller", self.attempt_id);
        self.biometric.cancel(self.attempt_id);
        self.deliver(SessionOutcome::Cancelled);
    }
}

struct SinkShared {
    core: Arc<SessionCore>,
}

impl Drop for SinkShared {
    fn drop(&mut self) {
        self.core.on_events_dropped();
    }
}

/// Event channel handed to the [`BiometricService`] for one attempt.
///
/// The first terminal event wins; everything after it is ignored, so a
/// service that double-reports cannot produce a second outcome. If every
/// clone is dropped before a terminal event, the session ends with
/// [`SessionErrorCode::Abandoned`].
#[derive(Clone)]
pub struct AuthEventSink {
    shared: Arc<SinkShared>,
}

impl AuthEventSink {
    pub(crate) fn new(core: Arc<SessionCore>) -> Self {
        Self {
            shared: Arc::new(SinkShared { core }),
        }
    }

    /// The sensor rejected a sample. The prompt stays up.
    pub fn failed(&self) {
        self.shared.core.on_failed();
    }

    /// The user authenticated; `token` authorizes the bound operation.
    pub fn succeeded(&self, token: AuthToken) {
        self.shared.core.on_succeeded(&token);
    }

    /// The prompt ended with an error.
    pub fn error(&self, code: SessionErrorCode, message: impl Into<String>) {
        self.shared.core.on_error(code, message.into());
    }

    /// Reports a raw platform error code, routing cancellation codes to
    /// [`cancelled`](Self::cancelled).
    pub fn platform_error(&self, code: i32, message: impl Into<String>) {
        match SessionErrorCode::from_platform_code(code) {
            Some(code) => self.error(code, message),
            None => self.cancelled(),
        }
    }

    /// The user or the system dismissed the prompt.
    pub fn cancelled(&self) {
        self.shared.core.on_cancelled();
    }

    /// Attempt these events belong to.
    #[must_use]
    pub fn attempt(&self) -> AttemptId {
        self.shared.core.attempt_id()
    }
}

impl fmt::Debug for AuthEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthEventSink")
            .field("attempt", &self.attempt())
            .finish()
    }
}

/// Cancels one session. Cheap to clone.
///
/// `cancel` is idempotent and a no-op once the session has finished.
#[derive(Clone)]
pub struct CancelHandle {
    core: Option<Arc<SessionCore>>,
}

impl CancelHandle {
    pub(crate) const fn new(core: Arc<SessionCore>) -> Self {
        Self { core: Some(core) }
    }

    /// Handle for a session that finished inside `start`.
    pub(crate) const fn finished() -> Self {
        Self { core: None }
    }

    /// Cancels the session if it is still pending.
    pub fn cancel(&self) {
        if let Some(core) = &self.core {
            core.cancel();
        }
    }

    /// Whether the session reached a terminal outcome.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.core.as_ref().map_or(true, |core| core.is_finished())
    }

    /// Attempt the handle controls, if the biometric service was reached.
    #[must_use]
    pub fn attempt(&self) -> Option<AttemptId> {
        self.core.as_ref().map(|core| core.attempt_id())
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("attempt", &self.attempt())
            .field("finished", &self.is_finished())
            .finish()
    }
}
