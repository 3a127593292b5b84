//! Waiting on signal values.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio::time;

use super::reading::Reading;
use super::value::SignalValue;
use super::Signal;
use crate::error::{AppResult, DaqError};
use crate::status::AsyncStatus;

struct Observation<T> {
    updates: mpsc::UnboundedReceiver<Reading<T>>,
    last: Option<T>,
}

/// Stream every value of `signal`, starting with the current one.
///
/// With a `timeout`, the stream yields a [`DaqError::ValueTimeout`] and ends
/// if no update arrives within that time of the previous one.
pub fn observe_value<T: SignalValue>(
    signal: &Signal<T>,
    timeout: Option<Duration>,
) -> BoxStream<'static, AppResult<T>> {
    let updates = match signal.subscribe() {
        Ok(updates) => updates,
        Err(e) => return stream::once(async move { Err(e) }).boxed(),
    };
    let name = signal.name();
    stream::unfold(
        Some(Observation {
            updates,
            last: None,
        }),
        move |state| {
            let name = name.clone();
            async move {
                let mut state = state?;
                let next = match timeout {
                    Some(limit) => match time::timeout(limit, state.updates.recv()).await {
                        Ok(next) => next,
                        Err(_) => {
                            let err = DaqError::ValueTimeout {
                                signal: name,
                                expected: "an update".into(),
                                last: format!("{:?}", state.last),
                                timeout: limit,
                            };
                            return Some((Err(err), None));
                        }
                    },
                    None => state.updates.recv().await,
                };
                let value = next?.value;
                state.last = Some(value.clone());
                Some((Ok(value), Some(state)))
            }
        },
    )
    .boxed()
}

/// Wait until `matcher` accepts a value of `signal`.
///
/// `expected` describes the condition in the timeout error.
pub async fn wait_for_value<T, F>(
    signal: &Signal<T>,
    matcher: F,
    expected: &str,
    timeout: Option<Duration>,
) -> AppResult<()>
where
    T: SignalValue,
    F: Fn(&T) -> bool + Send + Sync,
{
    let mut values = observe_value(signal, None);
    let mut last: Option<T> = None;
    let waiting = async {
        while let Some(value) = values.next().await {
            let value = value?;
            if matcher(&value) {
                return Ok(());
            }
            last = Some(value);
        }
        Err(DaqError::Cancelled(format!(
            "{} stopped updating",
            signal.name()
        )))
    };
    let Some(limit) = timeout else {
        return waiting.await;
    };
    let reached = time::timeout(limit, waiting).await;
    match reached {
        Ok(result) => result,
        Err(_) => Err(DaqError::ValueTimeout {
            signal: signal.name(),
            expected: expected.to_string(),
            last: format!("{last:?}"),
            timeout: limit,
        }),
    }
}

/// Wait until `signal` equals `expected`.
pub async fn wait_for_value_eq<T: SignalValue>(
    signal: &Signal<T>,
    expected: T,
    timeout: Option<Duration>,
) -> AppResult<()> {
    let description = format!("{expected:?}");
    wait_for_value(signal, move |v| *v == expected, &description, timeout).await
}

/// Write `value` to `signal` and wait for its readback to match.
pub async fn set_and_wait_for_value<T: SignalValue>(
    signal: &Arc<Signal<T>>,
    value: T,
    timeout: Duration,
    wait_for_set_completion: bool,
) -> AppResult<AsyncStatus> {
    set_and_wait_for_other_value(
        signal,
        value.clone(),
        signal,
        value,
        timeout,
        wait_for_set_completion,
    )
    .await
}

/// Write `set_value` to `set_signal` and wait for `match_signal` to read
/// `match_value`.
///
/// Monitoring starts before the write so a fast readback is not missed. The
/// write runs in the background; its status is returned so callers can wait
/// for completion later, or it is awaited here when
/// `wait_for_set_completion` is set. `timeout` bounds the wait for the
/// readback only: on hardware whose write completes when the operation ends
/// (an acquisition, a capture) the write may legitimately run much longer.
pub async fn set_and_wait_for_other_value<S: SignalValue, M: SignalValue>(
    set_signal: &Arc<Signal<S>>,
    set_value: S,
    match_signal: &Signal<M>,
    match_value: M,
    timeout: Duration,
    wait_for_set_completion: bool,
) -> AppResult<AsyncStatus> {
    let mut values = observe_value(match_signal, None);
    let mut last = match values.next().await {
        Some(current) => Some(current?),
        None => None,
    };
    let status = set_signal.set_status(set_value, None);

    if last.as_ref() != Some(&match_value) {
        let waiting = async {
            while let Some(value) = values.next().await {
                let value = value?;
                if value == match_value {
                    return Ok(());
                }
                last = Some(value);
            }
            Err(DaqError::Cancelled(format!(
                "{} stopped updating",
                match_signal.name()
            )))
        };
        let reached = time::timeout(timeout, waiting).await;
        match reached {
            Ok(result) => result?,
            Err(_) => {
                return Err(DaqError::ValueTimeout {
                    signal: match_signal.name(),
                    expected: format!("{match_value:?}"),
                    last: format!("{last:?}"),
                    timeout,
                })
            }
        }
    }
    if wait_for_set_completion {
        status.wait().await?;
    }
    Ok(status)
}
