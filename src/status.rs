//! Completion handles for background operations.
//!
//! [`AsyncStatus`] wraps a spawned task. It can be cloned and awaited from
//! any number of places; every waiter sees the same outcome. Cancelling it
//! aborts the task and resolves every waiter with [`DaqError::Cancelled`].
//!
//! [`WatchableStatus`] adds a stream of [`WatcherUpdate`] progress values,
//! used by `StandardDetector::complete` to report frames written.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

use crate::error::{AppResult, DaqError};

#[derive(Debug, Clone)]
enum Outcome {
    Done,
    Failed(Arc<DaqError>),
}

#[derive(Debug)]
struct StatusInner {
    name: String,
    outcome: watch::Sender<Option<Outcome>>,
    task: Mutex<Option<AbortHandle>>,
}

impl StatusInner {
    fn finish(&self, result: AppResult<()>) {
        let outcome = match result {
            Ok(()) => Outcome::Done,
            Err(DaqError::Shared(shared)) => Outcome::Failed(shared),
            Err(e) => Outcome::Failed(Arc::new(e)),
        };
        self.outcome.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        });
    }
}

/// Shared handle on the completion of a background operation.
#[derive(Debug, Clone)]
pub struct AsyncStatus {
    inner: Arc<StatusInner>,
}

impl AsyncStatus {
    fn pending(name: String) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            inner: Arc::new(StatusInner {
                name,
                outcome,
                task: Mutex::new(None),
            }),
        }
    }

    /// Run `operation` as a task on the current runtime.
    pub fn spawn<F>(name: impl Into<String>, operation: F) -> Self
    where
        F: Future<Output = AppResult<()>> + Send + 'static,
    {
        let status = Self::pending(name.into());
        let inner = Arc::clone(&status.inner);
        let task = tokio::spawn(async move {
            let result = operation.await;
            inner.finish(result);
        });
        *status.inner.task.lock() = Some(task.abort_handle());
        status
    }

    /// A status that has already succeeded.
    pub fn completed(name: impl Into<String>) -> Self {
        let status = Self::pending(name.into());
        status.inner.finish(Ok(()));
        status
    }

    /// A status that has already failed.
    pub fn failed(name: impl Into<String>, error: DaqError) -> Self {
        let status = Self::pending(name.into());
        status.inner.finish(Err(error));
        status
    }

    /// Name used in logs and cancellation errors.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the operation has finished, successfully or not.
    pub fn is_done(&self) -> bool {
        self.inner.outcome.borrow().is_some()
    }

    /// `Some(true)` on success, `Some(false)` on failure, `None` while running.
    pub fn success(&self) -> Option<bool> {
        self.inner
            .outcome
            .borrow()
            .as_ref()
            .map(|o| matches!(o, Outcome::Done))
    }

    /// Wait for the outcome.
    pub async fn wait(&self) -> AppResult<()> {
        let mut outcome = self.inner.outcome.subscribe();
        let result = outcome
            .wait_for(Option::is_some)
            .await
            .map(|slot| (*slot).clone())
            .map_err(|_| DaqError::Cancelled(self.inner.name.clone()))?;
        match result {
            Some(Outcome::Done) => Ok(()),
            Some(Outcome::Failed(e)) => Err(DaqError::Shared(e)),
            None => Err(DaqError::Cancelled(self.inner.name.clone())),
        }
    }

    /// Wait for the outcome, failing with `Cancelled` after `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> AppResult<()> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| DaqError::Cancelled(format!("{} timed out after {timeout:?}", self.name())))?
    }

    /// Abort the operation. Every waiter resolves with `Cancelled`.
    ///
    /// No effect on a status that has already finished.
    pub fn cancel(&self) {
        if self.is_done() {
            return;
        }
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        debug!(status = %self.inner.name, "status cancelled");
        self.inner
            .finish(Err(DaqError::Cancelled(self.inner.name.clone())));
    }
}

/// Progress of a long-running operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatcherUpdate {
    /// What is being watched
    pub name: String,
    /// Current value
    pub current: f64,
    /// Value when watching started
    pub initial: f64,
    /// Value that completes the operation
    pub target: f64,
    /// Units of the values
    pub unit: String,
    /// Display precision
    pub precision: u32,
    /// Time since watching started
    pub time_elapsed: Option<Duration>,
    /// Estimated time until the target is reached
    pub time_remaining: Option<Duration>,
}

impl WatcherUpdate {
    /// Update without timing information.
    pub fn new(name: impl Into<String>, current: f64, initial: f64, target: f64) -> Self {
        Self {
            name: name.into(),
            current,
            initial,
            target,
            unit: String::new(),
            precision: 0,
            time_elapsed: None,
            time_remaining: None,
        }
    }

    /// Set the units.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Record elapsed time and estimate the remaining time.
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.time_elapsed = Some(elapsed);
        let done = self.current - self.initial;
        let left = self.target - self.current;
        self.time_remaining = if done > 0.0 && left >= 0.0 {
            Some(elapsed.mul_f64(left / done))
        } else {
            None
        };
        self
    }

    /// Fraction of the way from `initial` to `target`, in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        let span = self.target - self.initial;
        if span == 0.0 {
            return 1.0;
        }
        ((self.current - self.initial) / span).clamp(0.0, 1.0)
    }
}

/// [`AsyncStatus`] that also publishes progress.
#[derive(Debug, Clone)]
pub struct WatchableStatus {
    status: AsyncStatus,
    updates: watch::Receiver<Option<WatcherUpdate>>,
}

/// Sender half used by the operation behind a [`WatchableStatus`].
pub type ProgressSender = watch::Sender<Option<WatcherUpdate>>;

impl WatchableStatus {
    /// Run `operation` with a progress sender.
    pub fn spawn<F, Fut>(name: impl Into<String>, operation: F) -> Self
    where
        F: FnOnce(ProgressSender) -> Fut,
        Fut: Future<Output = AppResult<()>> + Send + 'static,
    {
        let (progress, updates) = watch::channel(None);
        Self {
            status: AsyncStatus::spawn(name, operation(progress)),
            updates,
        }
    }

    /// Underlying completion handle.
    pub fn status(&self) -> &AsyncStatus {
        &self.status
    }

    /// Subscribe to progress. The receiver holds the latest update.
    pub fn watch(&self) -> watch::Receiver<Option<WatcherUpdate>> {
        self.updates.clone()
    }

    /// Stream of progress updates, starting with the latest one.
    ///
    /// Intermediate updates may be skipped when the consumer lags.
    pub fn updates(&self) -> BoxStream<'static, WatcherUpdate> {
        WatchStream::new(self.updates.clone())
            .filter_map(futures::future::ready)
            .boxed()
    }

    /// Latest progress update.
    pub fn latest(&self) -> Option<WatcherUpdate> {
        self.updates.borrow().clone()
    }

    /// Wait for the outcome.
    pub async fn wait(&self) -> AppResult<()> {
        self.status.wait().await
    }

    /// Whether the operation has finished.
    pub fn is_done(&self) -> bool {
        self.status.is_done()
    }

    /// Abort the operation.
    pub fn cancel(&self) {
        self.status.cancel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_clone_sees_the_outcome() {
        let status = AsyncStatus::spawn("op", async { Ok(()) });
        let other = status.clone();
        status.wait().await.unwrap();
        other.wait().await.unwrap();
        assert_eq!(other.success(), Some(true));
    }

    #[tokio::test]
    async fn failure_is_shared() {
        let status = AsyncStatus::spawn("op", async {
            Err(DaqError::Transport("boom".into()))
        });
        let err = status.wait().await.unwrap_err();
        assert!(matches!(err.root(), DaqError::Transport(_)));
        assert!(status.clone().wait().await.is_err());
        assert_eq!(status.success(), Some(false));
    }

    #[tokio::test]
    async fn cancel_resolves_pending_waiters() {
        let status = AsyncStatus::spawn("forever", futures::future::pending());
        let waiter = {
            let status = status.clone();
            tokio::spawn(async move { status.wait().await })
        };
        tokio::task::yield_now().await;
        status.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert!(status.is_done());
    }

    #[test]
    fn cancel_after_completion_is_ignored() {
        let status = AsyncStatus::completed("done");
        status.cancel();
        assert_eq!(status.success(), Some(true));
    }

    #[test]
    fn watcher_fraction_and_estimate() {
        let update = WatcherUpdate::new("det", 5.0, 0.0, 10.0).with_elapsed(Duration::from_secs(2));
        assert_eq!(update.fraction(), 0.5);
        assert_eq!(update.time_remaining, Some(Duration::from_secs(2)));
        assert_eq!(WatcherUpdate::new("det", 0.0, 0.0, 0.0).fraction(), 1.0);
    }

    #[tokio::test]
    async fn watchable_publishes_progress() {
        let status = WatchableStatus::spawn("count", |progress| async move {
            for i in 1..=3 {
                progress.send_replace(Some(WatcherUpdate::new("count", i as f64, 0.0, 3.0)));
            }
            Ok(())
        });
        status.wait().await.unwrap();
        assert_eq!(status.latest().unwrap().current, 3.0);
    }

    #[tokio::test]
    async fn updates_stream_ends_with_final_progress() {
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
        let status = WatchableStatus::spawn("count", |progress| async move {
            progress.send_replace(Some(WatcherUpdate::new("count", 1.0, 0.0, 2.0)));
            let _ = gate_rx.await;
            progress.send_replace(Some(WatcherUpdate::new("count", 2.0, 0.0, 2.0)));
            Ok(())
        });
        let mut updates = status.updates();
        let first = updates.next().await.unwrap();
        assert_eq!(first.current, 1.0);
        gate_tx.send(()).unwrap();
        let second = updates.next().await.unwrap();
        assert_eq!(second.fraction(), 1.0);
        status.wait().await.unwrap();
    }
}
