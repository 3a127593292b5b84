//! Capability contract behind every signal.
//!
//! A [`Signal`](super::Signal) never talks to hardware itself. It holds a
//! [`Backend`], a tagged union of the three implementations of
//! [`SignalBackend`]:
//!
//! - [`LiveSignalBackend`]: bound to a remote endpoint through a
//!   [`Transport`](super::Transport)
//! - [`SoftSignalBackend`]: an in-process value
//! - [`MockSignalBackend`]: wraps either of the above for tests, never touching
//!   the remote endpoint
//!
//! The mock variant is selected by the `mock` flag of
//! [`ConnectOptions`](crate::device::ConnectOptions); the production backend
//! object is never mutated by that substitution.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::live::LiveSignalBackend;
use super::mock::MockSignalBackend;
use super::reading::{DataKey, Reading};
use super::soft::SoftSignalBackend;
use super::value::SignalValue;
use crate::error::AppResult;

/// Callback invoked with every new reading.
pub type ReadingCallback<T> = Arc<dyn Fn(&Reading<T>) + Send + Sync>;

/// Operations every backend provides.
#[async_trait]
pub trait SignalBackend<T: SignalValue>: Send + Sync {
    /// Source string for a signal called `name`.
    fn source(&self, name: &str) -> String;

    /// Make the backend usable, failing if it cannot be reached in `timeout`.
    async fn connect(&self, timeout: Duration) -> AppResult<()>;

    /// Write `value`. With `wait`, suspend until the write is acknowledged.
    async fn put(&self, value: T, wait: bool, timeout: Option<Duration>) -> AppResult<()>;

    /// Current value.
    async fn get_value(&self) -> AppResult<T>;

    /// Current value with timestamp and severity.
    async fn get_reading(&self) -> AppResult<Reading<T>>;

    /// Last value written, which may differ from the readback.
    async fn get_setpoint(&self) -> AppResult<T>;

    /// Static description of the value.
    async fn get_datakey(&self, source: &str) -> AppResult<DataKey>;

    /// Register the single change callback, or clear it with `None`.
    ///
    /// A new callback is invoked promptly with the current reading.
    fn set_change_callback(&self, callback: Option<ReadingCallback<T>>) -> AppResult<()>;
}

/// Which kind of backend a signal is using.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Remote endpoint
    Live,
    /// In-process value
    Soft,
    /// Test double
    Mock,
}

/// Tagged backend held by a signal.
pub enum Backend<T: SignalValue> {
    /// Remote endpoint
    Live(Arc<LiveSignalBackend<T>>),
    /// In-process value
    Soft(Arc<SoftSignalBackend<T>>),
    /// Test double wrapping the production backend
    Mock(Arc<MockSignalBackend<T>>),
}

impl<T: SignalValue> Clone for Backend<T> {
    fn clone(&self) -> Self {
        match self {
            Backend::Live(b) => Backend::Live(Arc::clone(b)),
            Backend::Soft(b) => Backend::Soft(Arc::clone(b)),
            Backend::Mock(b) => Backend::Mock(Arc::clone(b)),
        }
    }
}

impl<T: SignalValue> std::fmt::Debug for Backend<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Backend::{:?}", self.kind())
    }
}

impl<T: SignalValue> Backend<T> {
    /// Kind of this backend.
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Live(_) => BackendKind::Live,
            Backend::Soft(_) => BackendKind::Soft,
            Backend::Mock(_) => BackendKind::Mock,
        }
    }

    /// The mock backend, if this is one.
    pub fn as_mock(&self) -> Option<&Arc<MockSignalBackend<T>>> {
        match self {
            Backend::Mock(mock) => Some(mock),
            _ => None,
        }
    }

    fn as_dyn(&self) -> &dyn SignalBackend<T> {
        match self {
            Backend::Live(b) => b.as_ref(),
            Backend::Soft(b) => b.as_ref(),
            Backend::Mock(b) => b.as_ref(),
        }
    }

    /// See [`SignalBackend::source`].
    pub fn source(&self, name: &str) -> String {
        self.as_dyn().source(name)
    }

    /// See [`SignalBackend::connect`].
    pub async fn connect(&self, timeout: Duration) -> AppResult<()> {
        self.as_dyn().connect(timeout).await
    }

    /// See [`SignalBackend::put`].
    pub async fn put(&self, value: T, wait: bool, timeout: Option<Duration>) -> AppResult<()> {
        self.as_dyn().put(value, wait, timeout).await
    }

    /// See [`SignalBackend::get_value`].
    pub async fn get_value(&self) -> AppResult<T> {
        self.as_dyn().get_value().await
    }

    /// See [`SignalBackend::get_reading`].
    pub async fn get_reading(&self) -> AppResult<Reading<T>> {
        self.as_dyn().get_reading().await
    }

    /// See [`SignalBackend::get_setpoint`].
    pub async fn get_setpoint(&self) -> AppResult<T> {
        self.as_dyn().get_setpoint().await
    }

    /// See [`SignalBackend::get_datakey`].
    pub async fn get_datakey(&self, source: &str) -> AppResult<DataKey> {
        self.as_dyn().get_datakey(source).await
    }

    /// See [`SignalBackend::set_change_callback`].
    pub fn set_change_callback(&self, callback: Option<ReadingCallback<T>>) -> AppResult<()> {
        self.as_dyn().set_change_callback(callback)
    }
}
