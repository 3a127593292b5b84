//! Readings and data keys.

use std::time::Instant;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use super::value::{Dtype, SignalValue};

static CLOCK_ANCHOR: Lazy<Instant> = Lazy::new(Instant::now);

/// Seconds on a process-local monotonic clock.
///
/// Readings are stamped with this rather than wall-clock time so that
/// timestamps from one process never go backwards.
pub fn monotonic_seconds() -> f64 {
    CLOCK_ANCHOR.elapsed().as_secs_f64()
}

/// Quality tag attached to every reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Value is good
    #[default]
    NoAlarm,
    /// Value is outside the warning limits
    Minor,
    /// Value is outside the alarm limits
    Major,
    /// Value cannot be trusted
    Invalid,
}

/// A value together with when it was produced and how trustworthy it is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading<T> {
    /// The value
    pub value: T,
    /// Monotonic timestamp in seconds
    pub timestamp: f64,
    /// Alarm severity
    pub alarm_severity: Severity,
}

impl<T> Reading<T> {
    /// Reading stamped now with no alarm.
    pub fn now(value: T) -> Self {
        Self {
            value,
            timestamp: monotonic_seconds(),
            alarm_severity: Severity::NoAlarm,
        }
    }
}

/// Engineering limits of a value.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Limits {
    /// Lower limit
    pub low: Option<f64>,
    /// Upper limit
    pub high: Option<f64>,
}

/// Optional engineering metadata a backend may know about its value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalMetadata {
    /// Engineering units
    #[serde(default)]
    pub units: Option<String>,
    /// Display precision
    #[serde(default)]
    pub precision: Option<u32>,
    /// Engineering limits
    #[serde(default)]
    pub limits: Option<Limits>,
}

impl SignalMetadata {
    /// Metadata carrying only units.
    pub fn with_units(units: impl Into<String>) -> Self {
        Self {
            units: Some(units.into()),
            ..Default::default()
        }
    }

    /// Set the display precision.
    pub fn precision(mut self, precision: u32) -> Self {
        self.precision = Some(precision);
        self
    }

    /// Set the engineering limits.
    pub fn limits(mut self, low: f64, high: f64) -> Self {
        self.limits = Some(Limits {
            low: Some(low),
            high: Some(high),
        });
        self
    }
}

/// Static description of one field of a reading.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataKey {
    /// Where the value comes from
    pub source: String,
    /// Dtype class
    pub dtype: Dtype,
    /// Numpy dtype tag
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dtype_numpy: String,
    /// Shape, empty for scalars
    pub shape: Vec<usize>,
    /// Set when the payload is delivered out of band by documents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<String>,
    /// Engineering units
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    /// Display precision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    /// Engineering limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<Limits>,
    /// Allowed values for enums
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
}

impl DataKey {
    /// Describe `value` as coming from `source`.
    pub fn for_value<T: SignalValue>(source: &str, value: &T, metadata: &SignalMetadata) -> Self {
        Self {
            source: source.to_string(),
            dtype: T::dtype(),
            dtype_numpy: T::dtype_numpy().to_string(),
            shape: value.shape(),
            external: None,
            units: metadata.units.clone(),
            precision: metadata.precision,
            limits: metadata.limits,
            choices: T::choices(),
        }
    }
}
