//! Wire-level transport seam and an in-memory implementation.
//!
//! A [`Transport`] moves untyped JSON values to and from named remote
//! addresses. Typing, timeouts and callback bookkeeping happen in
//! [`LiveSignalBackend`](super::LiveSignalBackend), so a transport only needs
//! to know how to reach its endpoints.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use super::reading::{monotonic_seconds, Severity, SignalMetadata};
use crate::error::{AppResult, DaqError};

/// Untyped reading as delivered by a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RawReading {
    /// Value as JSON
    pub value: Value,
    /// Monotonic timestamp in seconds
    pub timestamp: f64,
    /// Alarm severity
    pub severity: Severity,
}

impl RawReading {
    /// Reading stamped now with no alarm.
    pub fn now(value: Value) -> Self {
        Self {
            value,
            timestamp: monotonic_seconds(),
            severity: Severity::NoAlarm,
        }
    }
}

/// Operations a wire protocol must offer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// URI scheme used in signal sources, e.g. `ca` or `mem`.
    fn scheme(&self) -> &str;

    /// Wait until `address` is reachable and return its metadata.
    ///
    /// May never return for an endpoint that never appears; callers bound it
    /// with a timeout.
    async fn connect(&self, address: &str) -> AppResult<SignalMetadata>;

    /// Read the current value.
    async fn get(&self, address: &str) -> AppResult<RawReading>;

    /// Write a value, suspending until the remote side acknowledges when `wait`.
    async fn put(&self, address: &str, value: Value, wait: bool) -> AppResult<()>;

    /// Subscribe to changes. The first item is the current value.
    fn monitor(&self, address: &str) -> AppResult<mpsc::UnboundedReceiver<RawReading>>;
}

/// Hook run on every put to an in-memory endpoint.
pub type EndpointHook = Arc<dyn Fn(&Value) + Send + Sync>;

struct Endpoint {
    reading: RawReading,
    metadata: SignalMetadata,
    reachable: watch::Sender<bool>,
    put_delay: Option<Duration>,
    on_put: Option<EndpointHook>,
    subscribers: Vec<mpsc::UnboundedSender<RawReading>>,
}

impl Endpoint {
    fn publish(&mut self, reading: RawReading) {
        self.reading = reading.clone();
        self.subscribers.retain(|tx| tx.send(reading.clone()).is_ok());
    }
}

/// Transport whose endpoints live in process memory.
///
/// Used for simulations and for exercising the live backend in tests:
/// endpoints can be made unreachable, and waiting puts can be slowed down.
///
/// ```rust,ignore
/// let transport = Arc::new(InMemoryTransport::new("mem"));
/// transport.add_endpoint("DET:Acquire", false, SignalMetadata::default())?;
/// let acquire = Signal::live_rw(transport.clone(), "DET:Acquire", "DET:Acquire");
/// ```
pub struct InMemoryTransport {
    scheme: String,
    endpoints: Mutex<HashMap<String, Endpoint>>,
    pending: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl InMemoryTransport {
    /// Empty transport using `scheme` in source strings.
    pub fn new(scheme: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            endpoints: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a reachable endpoint holding `initial`.
    pub fn add_endpoint<V: Serialize>(
        &self,
        address: &str,
        initial: V,
        metadata: SignalMetadata,
    ) -> AppResult<()> {
        let value = to_json(address, initial)?;
        let (reachable, _) = watch::channel(true);
        self.endpoints.lock().insert(
            address.to_string(),
            Endpoint {
                reading: RawReading::now(value),
                metadata,
                reachable,
                put_delay: None,
                on_put: None,
                subscribers: Vec::new(),
            },
        );
        if let Some(waiters) = self.pending.lock().remove(address) {
            waiters.send_replace(true);
        }
        Ok(())
    }

    /// Make an endpoint reachable or unreachable.
    pub fn set_reachable(&self, address: &str, reachable: bool) -> AppResult<()> {
        self.with_endpoint(address, |ep| {
            ep.reachable.send_replace(reachable);
        })
    }

    /// Delay acknowledgement of waiting puts.
    pub fn set_put_delay(&self, address: &str, delay: Option<Duration>) -> AppResult<()> {
        self.with_endpoint(address, |ep| ep.put_delay = delay)
    }

    /// Run `hook` on every put to `address`, after the value is stored.
    pub fn on_put(&self, address: &str, hook: EndpointHook) -> AppResult<()> {
        self.with_endpoint(address, |ep| ep.on_put = Some(hook))
    }

    /// Change a value from the hardware side, notifying monitors.
    pub fn set_value<V: Serialize>(&self, address: &str, value: V) -> AppResult<()> {
        let value = to_json(address, value)?;
        self.with_endpoint(address, |ep| ep.publish(RawReading::now(value)))
    }

    /// Current raw value of an endpoint.
    pub fn value(&self, address: &str) -> AppResult<Value> {
        self.with_endpoint(address, |ep| ep.reading.value.clone())
    }

    /// Number of live monitors on an endpoint.
    pub fn monitor_count(&self, address: &str) -> usize {
        self.endpoints
            .lock()
            .get_mut(address)
            .map(|ep| {
                ep.subscribers.retain(|tx| !tx.is_closed());
                ep.subscribers.len()
            })
            .unwrap_or(0)
    }

    fn with_endpoint<R>(&self, address: &str, f: impl FnOnce(&mut Endpoint) -> R) -> AppResult<R> {
        let mut endpoints = self.endpoints.lock();
        let endpoint = endpoints
            .get_mut(address)
            .ok_or_else(|| DaqError::Transport(format!("unknown endpoint '{address}'")))?;
        Ok(f(endpoint))
    }

    fn reachable(&self, address: &str) -> AppResult<()> {
        let reachable = self.with_endpoint(address, |ep| *ep.reachable.borrow())?;
        if reachable {
            Ok(())
        } else {
            Err(DaqError::Transport(format!("endpoint '{address}' unreachable")))
        }
    }
}

fn to_json<V: Serialize>(address: &str, value: V) -> AppResult<Value> {
    serde_json::to_value(value).map_err(|e| DaqError::TypeMismatch {
        signal: address.to_string(),
        expected: "JSON-serializable value",
        message: e.to_string(),
    })
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    async fn connect(&self, address: &str) -> AppResult<SignalMetadata> {
        loop {
            let mut gate = {
                let endpoints = self.endpoints.lock();
                match endpoints.get(address) {
                    Some(ep) if *ep.reachable.borrow() => return Ok(ep.metadata.clone()),
                    Some(ep) => ep.reachable.subscribe(),
                    None => self
                        .pending
                        .lock()
                        .entry(address.to_string())
                        .or_insert_with(|| watch::channel(false).0)
                        .subscribe(),
                }
            };
            if gate.wait_for(|up| *up).await.is_err() {
                return Err(DaqError::Transport(format!(
                    "endpoint '{address}' was removed"
                )));
            }
        }
    }

    async fn get(&self, address: &str) -> AppResult<RawReading> {
        self.reachable(address)?;
        self.with_endpoint(address, |ep| ep.reading.clone())
    }

    async fn put(&self, address: &str, value: Value, wait: bool) -> AppResult<()> {
        self.reachable(address)?;
        let (delay, hook) = self.with_endpoint(address, |ep| {
            ep.publish(RawReading::now(value.clone()));
            (ep.put_delay, ep.on_put.clone())
        })?;
        if let Some(hook) = hook {
            hook(&value);
        }
        if let (true, Some(delay)) = (wait, delay) {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    fn monitor(&self, address: &str) -> AppResult<mpsc::UnboundedReceiver<RawReading>> {
        self.with_endpoint(address, |ep| {
            let (tx, rx) = mpsc::unbounded_channel();
            // Receiver is alive, so this send cannot fail.
            let _ = tx.send(ep.reading.clone());
            ep.subscribers.push(tx);
            rx
        })
    }
}
