//! Process-wide registry of live monitor tasks.
//!
//! Every live signal that has subscribers runs one forwarding task turning
//! transport updates into typed readings. Those tasks are owned by the
//! [`MonitorContext`] singleton:
//!
//! - created lazily by the first subscription ([`MonitorContext::global`])
//! - a task lives exactly as long as the [`MonitorHandle`] returned for it
//! - [`MonitorContext::shutdown`] aborts every task and drops the singleton;
//!   the next subscription creates a fresh context

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::error::{AppResult, DaqError};

static CONTEXT: Lazy<Mutex<Option<Arc<MonitorContext>>>> = Lazy::new(|| Mutex::new(None));

/// Owner of all live monitor tasks.
#[derive(Debug, Default)]
pub struct MonitorContext {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, AbortHandle>>,
}

impl MonitorContext {
    /// The shared context, created on first use.
    pub fn global() -> Arc<MonitorContext> {
        let mut slot = CONTEXT.lock();
        slot.get_or_insert_with(|| {
            debug!("creating monitor context");
            Arc::new(MonitorContext::default())
        })
        .clone()
    }

    /// Whether the shared context currently exists.
    pub fn is_initialized() -> bool {
        CONTEXT.lock().is_some()
    }

    /// Abort every monitor task and drop the shared context.
    pub fn shutdown() {
        let context = CONTEXT.lock().take();
        if let Some(context) = context {
            let tasks: Vec<_> = context.tasks.lock().drain().collect();
            info!(monitors = tasks.len(), "shutting down monitor context");
            for (_, task) in tasks {
                task.abort();
            }
        }
    }

    /// Number of monitor tasks currently registered.
    pub fn active_monitors(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Spawn `task` on the current runtime and register it.
    pub fn spawn<F>(self: &Arc<Self>, task: F) -> AppResult<MonitorHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| DaqError::Transport(format!("cannot start monitor: {e}")))?;
        let abort = runtime.spawn(task).abort_handle();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tasks.lock().insert(id, abort.clone());
        Ok(MonitorHandle {
            id,
            context: Arc::downgrade(self),
            abort,
        })
    }
}

/// Keeps one monitor task alive. Dropping it aborts the task.
#[derive(Debug)]
pub struct MonitorHandle {
    id: u64,
    context: Weak<MonitorContext>,
    abort: AbortHandle,
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.abort.abort();
        if let Some(context) = self.context.upgrade() {
            context.tasks.lock().remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[tokio::test]
    async fn handles_deregister_on_drop() {
        let context = Arc::new(MonitorContext::default());
        let handle = context.spawn(futures::future::pending()).unwrap();
        assert_eq!(context.active_monitors(), 1);
        drop(handle);
        assert_eq!(context.active_monitors(), 0);
    }

    #[tokio::test]
    #[serial]
    async fn shutdown_drops_the_singleton() {
        let first = MonitorContext::global();
        let _handle = first.spawn(futures::future::pending()).unwrap();
        assert!(MonitorContext::is_initialized());
        MonitorContext::shutdown();
        assert!(!MonitorContext::is_initialized());
        assert_eq!(first.active_monitors(), 0);
        // A new context is created on next use.
        assert!(!Arc::ptr_eq(&first, &MonitorContext::global()));
    }
}
