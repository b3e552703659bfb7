//! Bridges load callbacks to a single awaitable result.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::domain::entities::WorkHandle;
use crate::domain::errors::{AggregateLoadError, LoadError, LoadFailure};
use crate::domain::ports::LoadObserver;

type Outcome = Result<WorkHandle, LoadFailure>;

/// Observer that collects errors and resolves a [`Completion`] on finish.
///
/// Registered after the request's own observers, so those run first and
/// still see every error.
pub struct CompletionBridge {
    errors: Mutex<Option<Vec<LoadError>>>,
    sender: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl CompletionBridge {
    /// Creates a bridge and the future it resolves.
    #[must_use]
    pub fn new() -> (Arc<Self>, Completion) {
        let (tx, rx) = oneshot::channel();
        let bridge = Arc::new(Self {
            errors: Mutex::new(None),
            sender: Mutex::new(Some(tx)),
        });
        (bridge, Completion { rx })
    }
}

impl LoadObserver for CompletionBridge {
    fn on_error(&self, error: &LoadError) {
        self.errors
            .lock()
            .get_or_insert_with(Vec::new)
            .push(error.clone());
    }

    fn on_finish(&self, work: &WorkHandle) {
        let Some(tx) = self.sender.lock().take() else {
            return;
        };
        let outcome = match self.errors.lock().take() {
            Some(errors) => Err(AggregateLoadError::new(errors).into()),
            None => Ok(work.clone()),
        };
        if tx.send(outcome).is_err() {
            trace!(key = %work.key(), "Completion dropped before load finished");
        }
    }
}

/// Resolves when the bridged load finishes.
///
/// Resolves to [`LoadFailure::Cancelled`] if the load is dropped without
/// finishing.
#[must_use = "futures do nothing unless awaited"]
pub struct Completion {
    rx: oneshot::Receiver<Outcome>,
}

impl Future for Completion {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(LoadFailure::Cancelled)))
    }
}
