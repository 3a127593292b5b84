//! Test double backend.
//!
//! A [`MockSignalBackend`] stores its value in a private
//! [`SoftSignalBackend`] seeded from the production backend, records every
//! `put`, and exposes a `put_proceeds` gate so tests can hold a
//! `put(wait=true)` pending.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use super::backend::{Backend, ReadingCallback, SignalBackend};
use super::reading::{DataKey, Reading, SignalMetadata};
use super::soft::SoftSignalBackend;
use super::value::SignalValue;
use crate::error::{AppResult, DaqError};

/// One recorded `put` on a mock backend.
#[derive(Debug, Clone, PartialEq)]
pub struct PutCall<T> {
    /// Value written
    pub value: T,
    /// Whether the caller waited for completion
    pub wait: bool,
}

/// Hook run on every mock `put`, before the value is stored.
pub type PutHook<T> = Arc<dyn Fn(&T, bool) + Send + Sync>;

/// Backend that stands in for a live or soft backend during tests.
pub struct MockSignalBackend<T: SignalValue> {
    initial: Option<Backend<T>>,
    store: SoftSignalBackend<T>,
    put_proceeds: watch::Sender<bool>,
    put_calls: Mutex<Vec<PutCall<T>>>,
    put_hook: Mutex<Option<PutHook<T>>>,
}

impl<T: SignalValue> MockSignalBackend<T> {
    /// Wrap `initial`, the production backend this mock mimics.
    ///
    /// A soft production backend seeds the mock store with its current
    /// reading. A live one cannot be read without connecting, so the store
    /// starts at the type's default value.
    pub fn new(initial: Option<Backend<T>>) -> Self {
        let (seed, metadata) = match &initial {
            Some(Backend::Soft(soft)) => (Some(soft.reading().value), soft.metadata().clone()),
            _ => (None, SignalMetadata::default()),
        };
        let (put_proceeds, _) = watch::channel(true);
        Self {
            initial: initial.filter(|b| b.as_mock().is_none()),
            store: SoftSignalBackend::new(seed, metadata),
            put_proceeds,
            put_calls: Mutex::new(Vec::new()),
            put_hook: Mutex::new(None),
        }
    }

    /// Drive the readback value as the hardware would.
    pub fn set_value(&self, value: T) {
        self.store.set_value(value);
    }

    /// Drive the whole reading, including severity.
    pub fn set_reading(&self, reading: Reading<T>) {
        self.store.set_reading(reading);
    }

    /// Open or close the gate that completes waiting puts.
    pub fn set_put_proceeds(&self, proceeds: bool) {
        self.put_proceeds.send_replace(proceeds);
    }

    /// Whether waiting puts currently complete.
    pub fn put_proceeds(&self) -> bool {
        *self.put_proceeds.borrow()
    }

    /// Every put since creation or the last reset.
    pub fn put_calls(&self) -> Vec<PutCall<T>> {
        self.put_calls.lock().clone()
    }

    /// Forget recorded puts.
    pub fn reset_put_calls(&self) {
        self.put_calls.lock().clear();
    }

    /// Install or clear the put hook.
    pub fn set_put_hook(&self, hook: Option<PutHook<T>>) {
        *self.put_hook.lock() = hook;
    }

    async fn wait_for_gate(&self, timeout: Option<Duration>, endpoint: String) -> AppResult<()> {
        let mut gate = self.put_proceeds.subscribe();
        let opened = async {
            gate.wait_for(|proceeds| *proceeds)
                .await
                .map(|_| ())
                .map_err(|_| DaqError::Cancelled(format!("{endpoint}: put gate dropped")))
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, opened)
                .await
                .map_err(|_| DaqError::PutTimeout {
                    endpoint: endpoint.clone(),
                    timeout: limit,
                })?,
            None => opened.await,
        }
    }
}

#[async_trait]
impl<T: SignalValue> SignalBackend<T> for MockSignalBackend<T> {
    fn source(&self, name: &str) -> String {
        match &self.initial {
            Some(initial) => format!("mock+{}", initial.source(name)),
            None => format!("mock+{name}"),
        }
    }

    async fn connect(&self, _timeout: Duration) -> AppResult<()> {
        Ok(())
    }

    async fn put(&self, value: T, wait: bool, timeout: Option<Duration>) -> AppResult<()> {
        debug!(?value, wait, "mock put");
        self.put_calls.lock().push(PutCall {
            value: value.clone(),
            wait,
        });
        let hook = self.put_hook.lock().clone();
        if let Some(hook) = hook {
            hook(&value, wait);
        }
        self.store.put(value, wait, timeout).await?;
        if wait {
            self.wait_for_gate(timeout, "mock".to_string()).await?;
        }
        Ok(())
    }

    async fn get_value(&self) -> AppResult<T> {
        self.store.get_value().await
    }

    async fn get_reading(&self) -> AppResult<Reading<T>> {
        self.store.get_reading().await
    }

    async fn get_setpoint(&self) -> AppResult<T> {
        self.store.get_setpoint().await
    }

    async fn get_datakey(&self, source: &str) -> AppResult<DataKey> {
        self.store.get_datakey(source).await
    }

    fn set_change_callback(&self, callback: Option<ReadingCallback<T>>) -> AppResult<()> {
        self.store.set_change_callback(callback)
    }
}
