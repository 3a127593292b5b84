//! Typed, remotely backed values.
//!
//! A [`Signal<T>`] is the leaf of every device tree. It owns a production
//! [`Backend`] fixed at construction and, while connected in mock mode, a
//! [`MockSignalBackend`] wrapping it. Reads and writes are forwarded to the
//! active backend; change notifications are fanned out from one backend
//! callback to any number of subscribers.
//!
//! # Example
//!
//! ```rust,ignore
//! let transport: Arc<dyn Transport> = Arc::new(InMemoryTransport::new("mem"));
//! let exposure = Arc::new(Signal::<f64>::live_rw(transport, "DET:Exposure_RBV", "DET:Exposure"));
//! exposure.set_name("det.exposure");
//! exposure.connect(ConnectOptions::default()).await?;
//! exposure.set(0.1).await?;
//! ```

mod backend;
mod context;
mod live;
mod mock;
mod observe;
mod reading;
mod soft;
mod transport;
mod value;

pub use backend::{Backend, BackendKind, ReadingCallback, SignalBackend};
pub use context::{MonitorContext, MonitorHandle};
pub use live::LiveSignalBackend;
pub use mock::{MockSignalBackend, PutCall, PutHook};
pub use observe::{
    observe_value, set_and_wait_for_other_value, set_and_wait_for_value, wait_for_value,
    wait_for_value_eq,
};
pub use reading::{monotonic_seconds, DataKey, Limits, Reading, Severity, SignalMetadata};
pub use soft::SoftSignalBackend;
pub use transport::{EndpointHook, InMemoryTransport, RawReading, Transport};
pub use value::{Dtype, SignalValue};
pub(crate) use value::signal_enum;

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::DEFAULT_TIMEOUT;
use crate::device::{ConnectOptions, Connectable};
use crate::error::{AppResult, DaqError};
use crate::status::AsyncStatus;

/// Write access to a soft read-only signal.
pub type SoftSetter<T> = Arc<dyn Fn(T) + Send + Sync>;

struct ConnectState<T: SignalValue> {
    connected: bool,
    previous_mock: Option<bool>,
    mock: Option<Arc<MockSignalBackend<T>>>,
}

struct Subscribers<T> {
    senders: Vec<mpsc::UnboundedSender<Reading<T>>>,
    last: Option<Reading<T>>,
    registered: bool,
}

impl<T: Clone> Subscribers<T> {
    fn dispatch(&mut self, reading: &Reading<T>) {
        self.last = Some(reading.clone());
        self.senders.retain(|tx| tx.send(reading.clone()).is_ok());
    }
}

/// A typed value with a pluggable backend.
pub struct Signal<T: SignalValue> {
    name: RwLock<String>,
    production: Backend<T>,
    active: RwLock<Backend<T>>,
    read_only: bool,
    state: Mutex<ConnectState<T>>,
    connect_lock: tokio::sync::Mutex<()>,
    // Reads and writes hold this shared; a backend swap holds it exclusively.
    in_flight: tokio::sync::RwLock<()>,
    subscribers: Arc<Mutex<Subscribers<T>>>,
}

impl<T: SignalValue> Signal<T> {
    /// Signal over `backend`. The name is assigned later by the parent device.
    pub fn new(backend: Backend<T>, read_only: bool) -> Self {
        Self {
            name: RwLock::new(String::new()),
            production: backend.clone(),
            active: RwLock::new(backend),
            read_only,
            state: Mutex::new(ConnectState {
                connected: false,
                previous_mock: None,
                mock: None,
            }),
            connect_lock: tokio::sync::Mutex::new(()),
            in_flight: tokio::sync::RwLock::new(()),
            subscribers: Arc::new(Mutex::new(Subscribers {
                senders: Vec::new(),
                last: None,
                registered: false,
            })),
        }
    }

    /// Read-write soft signal holding `initial`.
    pub fn soft_rw(initial: T) -> Self {
        Self::soft_rw_with(initial, SignalMetadata::default())
    }

    /// Read-write soft signal with units, precision or limits.
    pub fn soft_rw_with(initial: T, metadata: SignalMetadata) -> Self {
        let backend = SoftSignalBackend::new(Some(initial), metadata);
        Self::new(Backend::Soft(Arc::new(backend)), false)
    }

    /// Read-only soft signal plus the setter that drives it.
    pub fn soft_r_and_setter(initial: T, metadata: SignalMetadata) -> (Self, SoftSetter<T>) {
        let backend = Arc::new(SoftSignalBackend::new(Some(initial), metadata));
        let store = backend.clone();
        let setter: SoftSetter<T> = Arc::new(move |value| store.set_value(value));
        (Self::new(Backend::Soft(backend), true), setter)
    }

    /// Read-write signal reading `read_address` and writing `write_address`.
    pub fn live_rw(
        transport: Arc<dyn Transport>,
        read_address: impl Into<String>,
        write_address: impl Into<String>,
    ) -> Self {
        let backend = LiveSignalBackend::new(transport, read_address, write_address);
        Self::new(Backend::Live(Arc::new(backend)), false)
    }

    /// Read-only signal on `address`.
    pub fn live_r(transport: Arc<dyn Transport>, address: impl Into<String>) -> Self {
        let address = address.into();
        let backend = LiveSignalBackend::new(transport, address.clone(), address);
        Self::new(Backend::Live(Arc::new(backend)), true)
    }

    /// Dotted path name.
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Set the dotted path name.
    pub fn set_name(&self, name: &str) {
        *self.name.write() = name.to_string();
    }

    /// Whether writes are refused.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn backend(&self) -> Backend<T> {
        self.active.read().clone()
    }

    /// Kind of the backend currently in use.
    pub fn backend_kind(&self) -> BackendKind {
        self.active.read().kind()
    }

    /// Source string of the active backend.
    pub fn source(&self) -> String {
        self.backend().source(&self.name())
    }

    /// Whether the last connect succeeded.
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// The mock backend, when connected in mock mode.
    pub fn mock(&self) -> AppResult<Arc<MockSignalBackend<T>>> {
        self.backend()
            .as_mock()
            .cloned()
            .ok_or_else(|| DaqError::NotMocked(self.name()))
    }

    /// Bind the backend selected by `options.mock` and connect it.
    ///
    /// Idempotent unless `force_reconnect` is set. Switching between mock and
    /// live across connects is refused. The backend is only swapped once no
    /// read or write is in flight; if one is still running when the connect
    /// budget runs out, the connect fails and the current backend stays.
    pub async fn connect(&self, options: ConnectOptions) -> AppResult<()> {
        let options = options.with_deadline();
        let _guard = self.connect_lock.lock().await;
        {
            let mut state = self.state.lock();
            if let Some(previous) = state.previous_mock {
                if previous != options.mock {
                    return Err(DaqError::MockModeMismatch {
                        requested: options.mock,
                        previous,
                    });
                }
            }
            state.previous_mock = Some(options.mock);
            if state.connected && !options.force_reconnect {
                return Ok(());
            }
        }

        let exclusive = tokio::time::timeout(options.remaining(), self.in_flight.write())
            .await
            .map_err(|_| DaqError::InvalidState {
                operation: "connect",
                state: format!("{} still has a read or write in flight", self.name()),
            })?;
        let backend = {
            let mut state = self.state.lock();
            state.connected = false;
            if options.mock {
                let mock = match &state.mock {
                    Some(mock) if !options.force_reconnect => mock.clone(),
                    _ => {
                        let mock = Arc::new(MockSignalBackend::new(Some(self.production.clone())));
                        state.mock = Some(mock.clone());
                        mock
                    }
                };
                Backend::Mock(mock)
            } else {
                self.production.clone()
            }
        };
        self.swap_backend(backend.clone())?;
        drop(exclusive);

        let timeout = options.remaining();
        let result = match tokio::time::timeout(timeout, backend.connect(timeout)).await {
            Ok(result) => result,
            Err(_) => Err(DaqError::ConnectionTimeout {
                endpoint: backend.source(&self.name()),
                timeout,
            }),
        };
        match &result {
            Ok(()) => {
                debug!(signal = %self.name(), source = %backend.source(&self.name()), "signal connected");
                self.state.lock().connected = true;
            }
            Err(e) => debug!(signal = %self.name(), error = %e, "signal connect failed"),
        }
        result
    }

    fn swap_backend(&self, backend: Backend<T>) -> AppResult<()> {
        let previous = std::mem::replace(&mut *self.active.write(), backend.clone());
        let registered = self.subscribers.lock().registered;
        if registered {
            previous.set_change_callback(None)?;
            backend.set_change_callback(Some(self.dispatcher()))?;
        }
        Ok(())
    }

    /// Current value.
    pub async fn get_value(&self) -> AppResult<T> {
        let _op = self.in_flight.read().await;
        self.backend().get_value().await
    }

    /// Current value with timestamp and severity.
    pub async fn get_reading(&self) -> AppResult<Reading<T>> {
        let _op = self.in_flight.read().await;
        self.backend().get_reading().await
    }

    /// Last value written.
    pub async fn get_setpoint(&self) -> AppResult<T> {
        let _op = self.in_flight.read().await;
        self.backend().get_setpoint().await
    }

    /// `{name: reading}`.
    pub async fn read(&self) -> AppResult<BTreeMap<String, Reading<T>>> {
        let reading = self.get_reading().await?;
        Ok(BTreeMap::from([(self.name(), reading)]))
    }

    /// `{name: data key}`.
    pub async fn describe(&self) -> AppResult<BTreeMap<String, DataKey>> {
        let _op = self.in_flight.read().await;
        let key = self.backend().get_datakey(&self.source()).await?;
        Ok(BTreeMap::from([(self.name(), key)]))
    }

    /// Write `value`, waiting for acknowledgement when `wait` is set.
    pub async fn put(&self, value: T, wait: bool, timeout: Option<Duration>) -> AppResult<()> {
        if self.read_only {
            return Err(DaqError::InvalidState {
                operation: "put",
                state: format!("{} is read-only", self.name()),
            });
        }
        debug!(signal = %self.name(), ?value, wait, "put");
        let _op = self.in_flight.read().await;
        self.backend()
            .put(value, wait, timeout)
            .await
            .map_err(|e| match e {
                DaqError::PutTimeout { timeout, .. } => {
                    warn!(signal = %self.name(), ?timeout, "put not acknowledged");
                    DaqError::PutTimeout {
                        endpoint: self.name(),
                        timeout,
                    }
                }
                other => other,
            })
    }

    /// Write `value` and wait up to the default timeout for acknowledgement.
    pub async fn set(&self, value: T) -> AppResult<()> {
        self.put(value, true, Some(DEFAULT_TIMEOUT)).await
    }

    /// Start a waiting write in the background and return its status.
    pub fn set_status(self: &Arc<Self>, value: T, timeout: Option<Duration>) -> AsyncStatus {
        let signal = Arc::clone(self);
        AsyncStatus::spawn(format!("set {}", self.name()), async move {
            signal.put(value, true, timeout).await
        })
    }

    /// Subscribe to readings. The first item is the current reading.
    pub fn subscribe(&self) -> AppResult<mpsc::UnboundedReceiver<Reading<T>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let register = {
            let mut subscribers = self.subscribers.lock();
            if let Some(last) = &subscribers.last {
                // Receiver is alive, so this send cannot fail.
                let _ = tx.send(last.clone());
            }
            subscribers.senders.push(tx);
            !std::mem::replace(&mut subscribers.registered, true)
        };
        if register {
            if let Err(e) = self.backend().set_change_callback(Some(self.dispatcher())) {
                let mut subscribers = self.subscribers.lock();
                subscribers.registered = false;
                subscribers.senders.clear();
                return Err(e);
            }
        }
        Ok(rx)
    }

    /// Drop every subscriber and release the backend callback.
    pub fn clear_subscriptions(&self) -> AppResult<()> {
        let registered = {
            let mut subscribers = self.subscribers.lock();
            subscribers.senders.clear();
            subscribers.last = None;
            std::mem::replace(&mut subscribers.registered, false)
        };
        if registered {
            self.backend().set_change_callback(None)?;
        }
        Ok(())
    }

    fn dispatcher(&self) -> ReadingCallback<T> {
        let subscribers = Arc::downgrade(&self.subscribers);
        Arc::new(move |reading: &Reading<T>| {
            if let Some(subscribers) = subscribers.upgrade() {
                subscribers.lock().dispatch(reading);
            }
        })
    }
}

impl<T: SignalValue> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.name())
            .field("type", &T::TYPE_NAME)
            .field("backend", &self.backend_kind())
            .finish()
    }
}

#[async_trait]
impl<T: SignalValue> Connectable for Signal<T> {
    fn name(&self) -> String {
        Signal::name(self)
    }

    fn set_name(&self, name: &str) {
        Signal::set_name(self, name)
    }

    async fn connect(&self, options: ConnectOptions) -> AppResult<()> {
        Signal::connect(self, options).await
    }

    fn is_connected(&self) -> bool {
        Signal::is_connected(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
