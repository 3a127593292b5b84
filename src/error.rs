//! Custom error types for the device layer.
//!
//! This module defines the primary error type, `DaqError`, shared by signals,
//! devices and detectors. Using the `thiserror` crate, it provides a centralized
//! and consistent way to report the failure modes of remote-backed hardware.
//!
//! ## Error Hierarchy
//!
//! - **Connection errors** - `ConnectionTimeout`, `NotConnected`, `MockModeMismatch`
//!   - Raised by `connect()` on a signal or device tree
//!   - Recovery: fix the endpoint and retry with `force_reconnect`
//!
//! - **Write errors** - `PutTimeout`, `ValueTimeout`
//!   - The value may or may not have taken effect, re-read to confirm
//!
//! - **Acquisition errors** - `UnsupportedTriggerMode`, `InvalidTriggerInfo`,
//!   `InsufficientDeadtime`, `WriteStallTimeout`, `CaptureStopTimeout`
//!   - Surfaced to the acquisition orchestrator, which decides whether to
//!     `disarm`/`close`
//!
//! `NotConnected` carries a [`ConnectErrors`] map with every failing child, so an
//! operator can fix every broken endpoint in one pass.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::detector::DetectorTrigger;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for signals, devices and detectors.
#[derive(Error, Debug)]
pub enum DaqError {
    /// An endpoint did not become reachable before the connect deadline.
    ///
    /// **Error Type**: Transient - retry `connect` once the endpoint is up.
    #[error("{endpoint}: connection timed out after {timeout:?}")]
    ConnectionTimeout {
        /// Signal name or remote address that failed to connect
        endpoint: String,
        /// Time budget that was exhausted
        timeout: Duration,
    },

    /// One or more children of a device failed to connect.
    ///
    /// Always carries every failing child, never only the first.
    #[error("Not connected:{0}")]
    NotConnected(ConnectErrors),

    /// A `put(wait=true)` was not acknowledged in time.
    ///
    /// **Error Type**: Ambiguous - the value may have been applied. Re-read the
    /// signal before deciding what to do.
    #[error("{endpoint}: put not acknowledged within {timeout:?}")]
    PutTimeout {
        /// Signal name or remote address
        endpoint: String,
        /// Time budget that was exhausted
        timeout: Duration,
    },

    /// A signal never reached the requested value.
    #[error("{signal} didn't match {expected} in {timeout:?}, last value {last}")]
    ValueTimeout {
        /// Name of the observed signal
        signal: String,
        /// Description of the expected value or predicate
        expected: String,
        /// Debug rendering of the last value seen
        last: String,
        /// Time budget that was exhausted
        timeout: Duration,
    },

    /// The controller cannot drive the requested trigger kind.
    #[error(
        "{controller} only supports the following trigger types: [{}] but was asked to use {requested}",
        format_triggers(.supported)
    )]
    UnsupportedTriggerMode {
        /// Controller that rejected the request
        controller: String,
        /// Trigger kind that was requested
        requested: DetectorTrigger,
        /// Trigger kinds the controller accepts
        supported: Vec<DetectorTrigger>,
    },

    /// A trigger request failed structural validation.
    #[error("Invalid trigger info: {0}")]
    InvalidTriggerInfo(String),

    /// The requested deadtime is shorter than the hardware can achieve.
    #[error("Detector needs at least {required}s deadtime, but trigger logic provides only {provided}s")]
    InsufficientDeadtime {
        /// Minimum deadtime reported by the controller
        required: f64,
        /// Deadtime carried by the trigger request
        provided: f64,
    },

    /// No new frames were written within the stall timeout.
    #[error("No progress on written indices after {timeout:?} (last index {last_index})")]
    WriteStallTimeout {
        /// Time budget that was exhausted
        timeout: Duration,
        /// Last index observed before the stall
        last_index: u64,
    },

    /// Hardware did not confirm that file capture stopped.
    #[error("Capture did not stop within {timeout:?}")]
    CaptureStopTimeout {
        /// Time budget that was exhausted
        timeout: Duration,
    },

    /// Operation is not valid in the current lifecycle state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// Operation that was attempted
        operation: &'static str,
        /// Description of the current state
        state: String,
    },

    /// A device was connected in a different mock mode than before.
    #[error(
        "connect(mock={requested}) called on a device where the previous connect was mock={previous}; changing mock value between connects is not permitted"
    )]
    MockModeMismatch {
        /// Mock flag of the rejected connect
        requested: bool,
        /// Mock flag of the earlier connect
        previous: bool,
    },

    /// A mock-only helper was used on a signal that is not in mock mode.
    #[error("Signal '{0}' is not connected in mock mode")]
    NotMocked(String),

    /// A change callback is already registered on the backend.
    #[error("Cannot set a callback on '{0}' when one is already set")]
    CallbackAlreadySet(String),

    /// An asynchronous operation was cancelled before completing.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// The transport reported a failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A value could not be converted to the signal's declared type.
    #[error("{signal}: expected {expected}: {message}")]
    TypeMismatch {
        /// Signal name or remote address
        signal: String,
        /// Declared value type
        expected: &'static str,
        /// Conversion failure detail
        message: String,
    },

    /// Configuration validation failed.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error shared between several waiters of one operation.
    #[error(transparent)]
    Shared(Arc<DaqError>),

    /// Arbitrary failure surfaced by an external collaborator.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DaqError {
    /// Follow `Shared` wrappers down to the original error.
    pub fn root(&self) -> &DaqError {
        match self {
            DaqError::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// Whether retrying the failed operation can reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        match self.root() {
            DaqError::ConnectionTimeout { .. }
            | DaqError::NotConnected(_)
            | DaqError::PutTimeout { .. }
            | DaqError::ValueTimeout { .. }
            | DaqError::WriteStallTimeout { .. }
            | DaqError::CaptureStopTimeout { .. }
            | DaqError::Transport(_)
            | DaqError::Cancelled(_) => true,
            _ => false,
        }
    }

    /// Whether this error (or the error it shares) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), DaqError::Cancelled(_))
    }
}

fn format_triggers(triggers: &[DetectorTrigger]) -> String {
    triggers
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// =============================================================================
// Aggregate connect failures
// =============================================================================

/// Every child that failed during one `connect`, keyed by child name.
///
/// Nested device failures appear as `DaqError::NotConnected` values, so the
/// full tree of failures is preserved. [`ConnectErrors::failed_paths`] flattens
/// it into dotted child paths.
#[derive(Debug, Default)]
pub struct ConnectErrors {
    errors: BTreeMap<String, DaqError>,
}

const INDENT: &str = "    ";

impl ConnectErrors {
    /// Create an empty error map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the failure of one child.
    pub fn insert(&mut self, child: impl Into<String>, error: DaqError) {
        self.errors.insert(child.into(), error);
    }

    /// True when no child failed.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of direct children that failed.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Cause recorded for a direct child.
    pub fn get(&self, child: &str) -> Option<&DaqError> {
        self.errors.get(child)
    }

    /// Names of the direct children that failed.
    pub fn names(&self) -> Vec<&str> {
        self.errors.keys().map(String::as_str).collect()
    }

    /// Iterate over `(child, cause)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &DaqError)> {
        self.errors.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Leaf paths of every failure, descending into nested device failures.
    pub fn failed_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        self.collect_paths("", &mut paths);
        paths
    }

    fn collect_paths(&self, prefix: &str, out: &mut Vec<String>) {
        for (name, error) in &self.errors {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}.{name}")
            };
            match error.root() {
                DaqError::NotConnected(nested) if !nested.is_empty() => {
                    nested.collect_paths(&path, out)
                }
                _ => out.push(path),
            }
        }
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, indent: &str) -> fmt::Result {
        writeln!(f)?;
        for (name, error) in &self.errors {
            match error.root() {
                DaqError::NotConnected(nested) => {
                    write!(f, "{indent}{name}: NotConnected:")?;
                    nested.write_indented(f, &format!("{indent}{INDENT}"))?;
                }
                other => writeln!(f, "{indent}{name}: {other}")?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for ConnectErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, "")
    }
}
