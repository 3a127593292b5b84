//! Helpers for driving signals connected in mock mode.
//!
//! Every helper fails with [`DaqError::NotMocked`] when the signal was not
//! connected with [`ConnectOptions::mock`](crate::device::ConnectOptions::mock).
//!
//! ```rust,ignore
//! det.connect(ConnectOptions::mock()).await?;
//! set_mock_value(&det.driver().array_size_x, 1024)?;
//! let acquire: &dyn PutGate = det.driver().acquire.as_ref();
//! let _blocked = mock_puts_blocked(&[acquire])?;
//! ```

use std::sync::Arc;

use tracing::debug;

use crate::error::{AppResult, DaqError};
use crate::signal::{MockSignalBackend, PutCall, Signal, SignalValue};

/// Drive the value a mocked signal reads back.
pub fn set_mock_value<T: SignalValue>(signal: &Signal<T>, value: T) -> AppResult<()> {
    signal.mock()?.set_value(value);
    Ok(())
}

/// Iterator that sets each value into a mocked signal as it is yielded.
pub struct MockValues<T: SignalValue, I> {
    name: String,
    backend: Arc<MockSignalBackend<T>>,
    values: I,
    consumed: usize,
}

impl<T: SignalValue, I: Iterator<Item = T>> Iterator for MockValues<T, I> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let value = self.values.next()?;
        self.backend.set_value(value.clone());
        self.consumed += 1;
        Some(value)
    }
}

impl<T: SignalValue, I: Iterator<Item = T>> MockValues<T, I> {
    /// Values set so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Fail if any value was never set.
    pub fn finish(mut self) -> AppResult<()> {
        let left: Vec<T> = self.values.by_ref().collect();
        if left.is_empty() {
            return Ok(());
        }
        Err(DaqError::InvalidState {
            operation: "finish mock values",
            state: format!(
                "{}: {} values were consumed but {left:?} were not",
                self.name, self.consumed
            ),
        })
    }
}

/// Set `values` into `signal` one per iteration.
///
/// ```rust,ignore
/// for frames in set_mock_values(&hdf.num_captured, 0..3)? {
///     // observe the detector at each step
/// }
/// ```
pub fn set_mock_values<T, I>(
    signal: &Signal<T>,
    values: I,
) -> AppResult<MockValues<T, I::IntoIter>>
where
    T: SignalValue,
    I: IntoIterator<Item = T>,
{
    Ok(MockValues {
        name: signal.name(),
        backend: signal.mock()?,
        values: values.into_iter(),
        consumed: 0,
    })
}

/// Allow or hold waiting puts on a mocked signal.
pub fn set_mock_put_proceeds<T: SignalValue>(signal: &Signal<T>, proceeds: bool) -> AppResult<()> {
    signal.mock()?.set_put_proceeds(proceeds);
    Ok(())
}

/// Signals whose waiting puts can be held, regardless of value type.
pub trait PutGate: Send + Sync {
    /// Open or close the gate.
    fn set_put_proceeds(&self, proceeds: bool) -> AppResult<()>;
}

impl<T: SignalValue> PutGate for Signal<T> {
    fn set_put_proceeds(&self, proceeds: bool) -> AppResult<()> {
        set_mock_put_proceeds(self, proceeds)
    }
}

/// Reopens held puts when dropped.
#[must_use = "puts are released as soon as the guard is dropped"]
pub struct PutsBlocked<'a> {
    signals: Vec<&'a dyn PutGate>,
}

impl Drop for PutsBlocked<'_> {
    fn drop(&mut self) {
        for signal in &self.signals {
            // Only mocked signals got this far.
            let _ = signal.set_put_proceeds(true);
        }
    }
}

/// Hold waiting puts on every signal until the guard is dropped.
pub fn mock_puts_blocked<'a>(signals: &[&'a dyn PutGate]) -> AppResult<PutsBlocked<'a>> {
    let mut blocked = PutsBlocked {
        signals: Vec::with_capacity(signals.len()),
    };
    for signal in signals {
        signal.set_put_proceeds(false)?;
        blocked.signals.push(*signal);
    }
    debug!(count = blocked.signals.len(), "mock puts blocked");
    Ok(blocked)
}

/// Puts recorded on a mocked signal.
pub fn get_mock_put_calls<T: SignalValue>(signal: &Signal<T>) -> AppResult<Vec<PutCall<T>>> {
    Ok(signal.mock()?.put_calls())
}

/// Forget puts recorded on a mocked signal.
pub fn reset_mock_put_calls<T: SignalValue>(signal: &Signal<T>) -> AppResult<()> {
    signal.mock()?.reset_put_calls();
    Ok(())
}

/// Removes a put callback when dropped, unless kept.
#[must_use = "the callback is removed as soon as the guard is dropped"]
pub struct MockPutCallback<T: SignalValue> {
    backend: Option<Arc<MockSignalBackend<T>>>,
}

impl<T: SignalValue> MockPutCallback<T> {
    /// Leave the callback installed for the life of the signal.
    pub fn keep(mut self) {
        self.backend = None;
    }
}

impl<T: SignalValue> Drop for MockPutCallback<T> {
    fn drop(&mut self) {
        if let Some(backend) = self.backend.take() {
            backend.set_put_hook(None);
        }
    }
}

/// Run `callback` with the value and wait flag of every put, before it lands.
pub fn callback_on_mock_put<T, F>(signal: &Signal<T>, callback: F) -> AppResult<MockPutCallback<T>>
where
    T: SignalValue,
    F: Fn(&T, bool) + Send + Sync + 'static,
{
    let backend = signal.mock()?;
    backend.set_put_hook(Some(Arc::new(callback)));
    Ok(MockPutCallback {
        backend: Some(backend),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ConnectOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn mocked<T: SignalValue>(initial: T) -> Arc<Signal<T>> {
        let signal = Arc::new(Signal::soft_rw(initial));
        signal.set_name("sig");
        signal.connect(ConnectOptions::mock()).await.unwrap();
        signal
    }

    #[tokio::test]
    async fn values_are_set_as_iterated() {
        let signal = mocked(0i32).await;
        let mut values = set_mock_values(signal.as_ref(), [3, 5, 8]).unwrap();
        assert_eq!(values.next(), Some(3));
        assert_eq!(signal.get_value().await.unwrap(), 3);
        assert_eq!(values.consumed(), 1);
        assert!(values.finish().is_err());

        let all: Vec<i32> = set_mock_values(signal.as_ref(), 0..3).unwrap().collect();
        assert_eq!(all, vec![0, 1, 2]);
        assert_eq!(signal.get_value().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn blocked_puts_release_on_drop() {
        let signal = mocked(0.0f64).await;
        let status = {
            let gate: &dyn PutGate = signal.as_ref();
            let _blocked = mock_puts_blocked(&[gate]).unwrap();
            let status = signal.set_status(1.0, None);
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(!status.is_done());
            status
        };
        status.wait_timeout(Duration::from_secs(1)).await.unwrap();
        assert_eq!(get_mock_put_calls(signal.as_ref()).unwrap().len(), 1);
        reset_mock_put_calls(signal.as_ref()).unwrap();
        assert!(get_mock_put_calls(signal.as_ref()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn callback_runs_until_guard_dropped() {
        let signal = mocked(String::new()).await;
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            let _guard = callback_on_mock_put(signal.as_ref(), move |value: &String, wait| {
                assert_eq!(value, "on");
                assert!(wait);
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            signal.set("on".to_string()).await.unwrap();
        }
        signal.set("off".to_string()).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn helpers_refuse_unmocked_signals() {
        let signal = Signal::soft_rw(1u8);
        signal.connect(ConnectOptions::default()).await.unwrap();
        assert!(matches!(
            set_mock_value(&signal, 2),
            Err(DaqError::NotMocked(_))
        ));
    }
}
