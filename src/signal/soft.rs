//! In-process signal backend.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::backend::{ReadingCallback, SignalBackend};
use super::reading::{DataKey, Reading, SignalMetadata};
use super::value::SignalValue;
use crate::error::{AppResult, DaqError};

struct SoftState<T> {
    reading: Reading<T>,
    setpoint: T,
    callback: Option<ReadingCallback<T>>,
}

/// Backend whose value lives in process memory.
///
/// `connect` is a no-op and `put` applies immediately, notifying the change
/// callback before returning.
pub struct SoftSignalBackend<T: SignalValue> {
    metadata: SignalMetadata,
    state: Mutex<SoftState<T>>,
}

impl<T: SignalValue> SoftSignalBackend<T> {
    /// Create a store holding `initial`, or the type's default value.
    pub fn new(initial: Option<T>, metadata: SignalMetadata) -> Self {
        let value = initial.unwrap_or_else(T::default_value);
        Self {
            metadata,
            state: Mutex::new(SoftState {
                reading: Reading::now(value.clone()),
                setpoint: value,
                callback: None,
            }),
        }
    }

    /// Metadata reported in the data key.
    pub fn metadata(&self) -> &SignalMetadata {
        &self.metadata
    }

    /// Replace the readback value and notify the callback.
    pub fn set_value(&self, value: T) {
        self.set_reading(Reading::now(value));
    }

    /// Replace the whole reading and notify the callback.
    pub fn set_reading(&self, reading: Reading<T>) {
        let callback = {
            let mut state = self.state.lock();
            state.reading = reading.clone();
            state.callback.clone()
        };
        if let Some(callback) = callback {
            callback(&reading);
        }
    }

    /// Synchronous snapshot of the current reading.
    pub fn reading(&self) -> Reading<T> {
        self.state.lock().reading.clone()
    }

    fn write(&self, value: T) {
        self.state.lock().setpoint = value.clone();
        self.set_value(value);
    }
}

#[async_trait]
impl<T: SignalValue> SignalBackend<T> for SoftSignalBackend<T> {
    fn source(&self, name: &str) -> String {
        format!("soft://{name}")
    }

    async fn connect(&self, _timeout: Duration) -> AppResult<()> {
        Ok(())
    }

    async fn put(&self, value: T, _wait: bool, _timeout: Option<Duration>) -> AppResult<()> {
        self.write(value);
        Ok(())
    }

    async fn get_value(&self) -> AppResult<T> {
        Ok(self.state.lock().reading.value.clone())
    }

    async fn get_reading(&self) -> AppResult<Reading<T>> {
        Ok(self.reading())
    }

    async fn get_setpoint(&self) -> AppResult<T> {
        Ok(self.state.lock().setpoint.clone())
    }

    async fn get_datakey(&self, source: &str) -> AppResult<DataKey> {
        let value = self.state.lock().reading.value.clone();
        Ok(DataKey::for_value(source, &value, &self.metadata))
    }

    fn set_change_callback(&self, callback: Option<ReadingCallback<T>>) -> AppResult<()> {
        let reading = {
            let mut state = self.state.lock();
            match callback {
                Some(ref callback) => {
                    if state.callback.is_some() {
                        return Err(DaqError::CallbackAlreadySet("soft".into()));
                    }
                    state.callback = Some(callback.clone());
                    state.reading.clone()
                }
                None => {
                    state.callback = None;
                    return Ok(());
                }
            }
        };
        if let Some(callback) = callback {
            callback(&reading);
        }
        Ok(())
    }
}
