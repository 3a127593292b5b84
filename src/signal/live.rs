//! Backend bound to a remote endpoint.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::backend::{ReadingCallback, SignalBackend};
use super::context::{MonitorContext, MonitorHandle};
use super::reading::{DataKey, Reading, SignalMetadata};
use super::transport::{RawReading, Transport};
use super::value::SignalValue;
use crate::error::{AppResult, DaqError};

/// Backend that reads from one address and writes to another.
///
/// Read-only and read-write signals share this type; for a read-only signal
/// both addresses are the same and the owning signal refuses writes.
pub struct LiveSignalBackend<T: SignalValue> {
    transport: Arc<dyn Transport>,
    read_address: String,
    write_address: String,
    metadata: Mutex<SignalMetadata>,
    setpoint: Mutex<Option<T>>,
    monitor: Mutex<Option<MonitorHandle>>,
    _value: PhantomData<fn() -> T>,
}

impl<T: SignalValue> LiveSignalBackend<T> {
    /// Bind to `read_address` and `write_address` on `transport`.
    pub fn new(
        transport: Arc<dyn Transport>,
        read_address: impl Into<String>,
        write_address: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            read_address: read_address.into(),
            write_address: write_address.into(),
            metadata: Mutex::new(SignalMetadata::default()),
            setpoint: Mutex::new(None),
            monitor: Mutex::new(None),
            _value: PhantomData,
        }
    }

    /// Address values are read from.
    pub fn read_address(&self) -> &str {
        &self.read_address
    }

    /// Address values are written to.
    pub fn write_address(&self) -> &str {
        &self.write_address
    }

    fn uri(&self) -> String {
        format!("{}://{}", self.transport.scheme(), self.read_address)
    }

    fn decode(&self, raw: RawReading) -> AppResult<Reading<T>> {
        decode(&self.read_address, raw)
    }
}

fn decode<T: SignalValue>(address: &str, raw: RawReading) -> AppResult<Reading<T>> {
    let value = serde_json::from_value(raw.value).map_err(|e| DaqError::TypeMismatch {
        signal: address.to_string(),
        expected: T::TYPE_NAME,
        message: e.to_string(),
    })?;
    Ok(Reading {
        value,
        timestamp: raw.timestamp,
        alarm_severity: raw.severity,
    })
}

#[async_trait]
impl<T: SignalValue> SignalBackend<T> for LiveSignalBackend<T> {
    fn source(&self, _name: &str) -> String {
        self.uri()
    }

    async fn connect(&self, timeout: Duration) -> AppResult<()> {
        let endpoint = self.uri();
        let connecting = async {
            if self.read_address == self.write_address {
                self.transport.connect(&self.read_address).await
            } else {
                let (metadata, _) = try_join(
                    self.transport.connect(&self.read_address),
                    self.transport.connect(&self.write_address),
                )
                .await?;
                Ok(metadata)
            }
        };
        let metadata = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| DaqError::ConnectionTimeout {
                endpoint: endpoint.clone(),
                timeout,
            })??;
        debug!(endpoint = %endpoint, "live backend connected");
        *self.metadata.lock() = metadata;
        Ok(())
    }

    async fn put(&self, value: T, wait: bool, timeout: Option<Duration>) -> AppResult<()> {
        let json = serde_json::to_value(&value).map_err(|e| DaqError::TypeMismatch {
            signal: self.write_address.clone(),
            expected: T::TYPE_NAME,
            message: e.to_string(),
        })?;
        *self.setpoint.lock() = Some(value);
        let writing = self.transport.put(&self.write_address, json, wait);
        match timeout {
            Some(limit) if wait => tokio::time::timeout(limit, writing)
                .await
                .map_err(|_| DaqError::PutTimeout {
                    endpoint: format!("{}://{}", self.transport.scheme(), self.write_address),
                    timeout: limit,
                })?,
            _ => writing.await,
        }
    }

    async fn get_value(&self) -> AppResult<T> {
        Ok(self.get_reading().await?.value)
    }

    async fn get_reading(&self) -> AppResult<Reading<T>> {
        let raw = self.transport.get(&self.read_address).await?;
        self.decode(raw)
    }

    async fn get_setpoint(&self) -> AppResult<T> {
        let written = self.setpoint.lock().clone();
        match written {
            Some(value) => Ok(value),
            None => {
                let raw = self.transport.get(&self.write_address).await?;
                Ok(decode::<T>(&self.write_address, raw)?.value)
            }
        }
    }

    async fn get_datakey(&self, source: &str) -> AppResult<DataKey> {
        let value = self.get_value().await?;
        let metadata = self.metadata.lock().clone();
        Ok(DataKey::for_value(source, &value, &metadata))
    }

    fn set_change_callback(&self, callback: Option<ReadingCallback<T>>) -> AppResult<()> {
        let mut monitor = self.monitor.lock();
        let Some(callback) = callback else {
            *monitor = None;
            return Ok(());
        };
        if monitor.is_some() {
            return Err(DaqError::CallbackAlreadySet(self.uri()));
        }
        let mut updates = self.transport.monitor(&self.read_address)?;
        let address = self.read_address.clone();
        let handle = MonitorContext::global().spawn(async move {
            while let Some(raw) = updates.recv().await {
                match decode::<T>(&address, raw) {
                    Ok(reading) => callback(&reading),
                    Err(e) => trace!(error = %e, "dropping undecodable update"),
                }
            }
        })?;
        *monitor = Some(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::transport::InMemoryTransport;
    use serial_test::serial;

    fn transport() -> Arc<InMemoryTransport> {
        let transport = Arc::new(InMemoryTransport::new("mem"));
        transport
            .add_endpoint("X:RBV", 1.5, SignalMetadata::with_units("mm"))
            .unwrap();
        transport
            .add_endpoint("X", 1.5, SignalMetadata::with_units("mm"))
            .unwrap();
        transport
    }

    #[tokio::test]
    async fn reads_typed_values_and_metadata() {
        let transport = transport();
        let backend = LiveSignalBackend::<f64>::new(transport, "X:RBV", "X");
        backend.connect(Duration::from_secs(1)).await.unwrap();
        assert_eq!(backend.get_value().await.unwrap(), 1.5);
        let key = backend.get_datakey("mem://X:RBV").await.unwrap();
        assert_eq!(key.units.as_deref(), Some("mm"));
        assert_eq!(backend.source("ignored"), "mem://X:RBV");
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_endpoint_times_out() {
        let backend = LiveSignalBackend::<f64>::new(transport(), "MISSING", "MISSING");
        let err = backend
            .connect(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::ConnectionTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_put_times_out() {
        let transport = transport();
        transport
            .set_put_delay("X", Some(Duration::from_secs(5)))
            .unwrap();
        let backend = LiveSignalBackend::<f64>::new(transport, "X:RBV", "X");
        let err = backend
            .put(2.0, true, Some(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::PutTimeout { .. }));
        // Without waiting the delay does not apply.
        backend.put(3.0, false, None).await.unwrap();
        assert_eq!(backend.get_setpoint().await.unwrap(), 3.0);
    }

    #[tokio::test]
    async fn wrong_type_is_reported() {
        let transport = transport();
        transport.set_value("X:RBV", "not a number").unwrap();
        let backend = LiveSignalBackend::<f64>::new(transport, "X:RBV", "X");
        assert!(matches!(
            backend.get_value().await,
            Err(DaqError::TypeMismatch { .. })
        ));
    }

    #[tokio::test]
    #[serial]
    async fn monitor_forwards_updates_until_cleared() {
        let transport = transport();
        let backend = LiveSignalBackend::<f64>::new(transport.clone(), "X:RBV", "X");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        backend
            .set_change_callback(Some(Arc::new(move |r: &Reading<f64>| {
                let _ = tx.send(r.value);
            })))
            .unwrap();
        assert_eq!(rx.recv().await, Some(1.5));
        transport.set_value("X:RBV", 4.0).unwrap();
        assert_eq!(rx.recv().await, Some(4.0));

        backend.set_change_callback(None).unwrap();
        assert_eq!(rx.recv().await, None);
    }
}
