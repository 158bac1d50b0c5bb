//! Cancellable timers owned by a session.
//!
//! A timer is a spawned task that posts an event into the session's
//! internal channel. Dropping the [`Timer`] aborts the task, so replacing
//! or clearing the owning field is the cancellation.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug)]
pub(crate) struct Timer {
    handle: JoinHandle<()>,
}

impl Timer {
    /// Posts `event` once after `delay`.
    pub(crate) fn once<T>(delay: Duration, tx: mpsc::UnboundedSender<T>, event: T) -> Self
    where
        T: Send + 'static,
    {
        Self::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        })
    }

    /// Posts an event every `period` until `cutoff` has elapsed.
    ///
    /// The first event comes one period after creation; no event is posted
    /// at or after the cutoff.
    pub(crate) fn repeat<T, F>(period: Duration, cutoff: Duration, tx: mpsc::UnboundedSender<T>, make: F) -> Self
    where
        T: Send + 'static,
        F: Fn() -> T + Send + 'static,
    {
        Self::spawn(async move {
            let deadline = Instant::now() + cutoff;
            loop {
                tokio::time::sleep(period).await;
                if Instant::now() >= deadline || tx.send(make()).is_err() {
                    break;
                }
            }
        })
    }

    /// Runs arbitrary background work under the same abort-on-drop rule.
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
