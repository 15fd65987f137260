use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use super::outcome::SessionOutcome;
use super::state::OutcomeCallback;

/// Observer for soft `Failed` outcomes while awaiting a [`PendingOutcome`].
pub type FailedObserver = Arc<dyn Fn() + Send + Sync>;

/// Future resolving to the terminal outcome of a session.
///
/// Resolves to [`SessionOutcome::Cancelled`] if the session is torn down
/// without delivering one.
#[derive(Debug)]
pub struct PendingOutcome {
    receiver: oneshot::Receiver<SessionOutcome>,
}

impl Future for PendingOutcome {
    type Output = SessionOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(SessionOutcome::Cancelled))
    }
}

/// Builds an outcome callback feeding a oneshot channel.
pub(crate) fn channel(on_failed: Option<FailedObserver>) -> (OutcomeCallback, PendingOutcome) {
    let (sender, receiver) = oneshot::channel();
    let mut sender = Some(sender);
    let callback: OutcomeCallback = Box::new(move |outcome: SessionOutcome| {
        if !outcome.is_terminal() {
            if let Some(observer) = &on_failed {
                observer();
            }
            return;
        }
        if let Some(sender) = sender.take() {
            // The receiver may already be gone; nobody is waiting then.
            let _ = sender.send(outcome);
        }
    });
    (callback, PendingOutcome { receiver })
}
