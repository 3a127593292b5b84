//! Trigger kinds and acquisition requests.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};

/// How the detector is told to take each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorTrigger {
    /// Detector generates its own triggers.
    #[default]
    Internal,
    /// Expect an external trigger edge, exposure set in software.
    EdgeTrigger,
    /// Expect a gate signal of constant length, exposure bound by the gate.
    ConstantGate,
    /// Expect a gate signal whose length may vary between frames.
    VariableGate,
}

impl DetectorTrigger {
    /// All trigger kinds, in declaration order.
    pub const ALL: [DetectorTrigger; 4] = [
        DetectorTrigger::Internal,
        DetectorTrigger::EdgeTrigger,
        DetectorTrigger::ConstantGate,
        DetectorTrigger::VariableGate,
    ];

    /// Wire name of this trigger kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorTrigger::Internal => "internal",
            DetectorTrigger::EdgeTrigger => "edge_trigger",
            DetectorTrigger::ConstantGate => "constant_gate",
            DetectorTrigger::VariableGate => "variable_gate",
        }
    }

    /// Whether frames are started by something other than the detector.
    pub fn is_external(&self) -> bool {
        !matches!(self, DetectorTrigger::Internal)
    }
}

impl fmt::Display for DetectorTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn one() -> u64 {
    1
}

/// One acquisition request.
///
/// `number_of_events == 0` requests an unbounded acquisition that runs until
/// the detector is disarmed.
///
/// # Example
///
/// ```rust,ignore
/// let info = TriggerInfo::new(10)
///     .with_trigger(DetectorTrigger::EdgeTrigger)
///     .with_livetime(0.01)
///     .with_deadtime(0.002);
/// detector.prepare(info).await?;
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerInfo {
    /// Number of logical events to acquire, 0 for "until stopped"
    pub number_of_events: u64,
    /// Trigger kind
    #[serde(default)]
    pub trigger: DetectorTrigger,
    /// Exposure time of each frame in seconds
    #[serde(default)]
    pub livetime: Option<f64>,
    /// Gap between frames in seconds
    #[serde(default)]
    pub deadtime: Option<f64>,
    /// Frames written per logical event
    #[serde(default = "one")]
    pub exposures_per_event: u64,
    /// Override for the write stall timeout of this acquisition
    #[serde(default, with = "humantime_serde")]
    pub frame_timeout: Option<Duration>,
}

impl Default for TriggerInfo {
    fn default() -> Self {
        Self::new(1)
    }
}

impl TriggerInfo {
    /// Internally triggered request for `number_of_events` events.
    pub fn new(number_of_events: u64) -> Self {
        Self {
            number_of_events,
            trigger: DetectorTrigger::Internal,
            livetime: None,
            deadtime: None,
            exposures_per_event: 1,
            frame_timeout: None,
        }
    }

    /// Set the trigger kind.
    pub fn with_trigger(mut self, trigger: DetectorTrigger) -> Self {
        self.trigger = trigger;
        self
    }

    /// Set the per-frame exposure.
    pub fn with_livetime(mut self, livetime: f64) -> Self {
        self.livetime = Some(livetime);
        self
    }

    /// Set the inter-frame gap.
    pub fn with_deadtime(mut self, deadtime: f64) -> Self {
        self.deadtime = Some(deadtime);
        self
    }

    /// Set how many frames make up one event.
    pub fn with_exposures_per_event(mut self, exposures: u64) -> Self {
        self.exposures_per_event = exposures;
        self
    }

    /// Set the write stall timeout.
    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = Some(timeout);
        self
    }

    /// Whether the acquisition runs until explicitly stopped.
    pub fn is_unbounded(&self) -> bool {
        self.number_of_events == 0
    }

    /// Frames the hardware must take, `None` when unbounded.
    pub fn total_frames(&self) -> Option<u64> {
        if self.is_unbounded() {
            None
        } else {
            Some(self.number_of_events.saturating_mul(self.exposures_per_event))
        }
    }

    /// Structural validation, independent of any controller.
    pub fn validate(&self) -> AppResult<()> {
        if self.exposures_per_event == 0 {
            return Err(DaqError::InvalidTriggerInfo(
                "exposures_per_event must be at least 1".into(),
            ));
        }
        for (label, value) in [("livetime", self.livetime), ("deadtime", self.deadtime)] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(DaqError::InvalidTriggerInfo(format!(
                        "{label} must be a non-negative number of seconds, got {v}"
                    )));
                }
            }
        }
        match self.trigger {
            DetectorTrigger::Internal if self.livetime.is_none() => Err(
                DaqError::InvalidTriggerInfo("internal trigger requires a livetime".into()),
            ),
            trigger if trigger.is_external() && self.deadtime.is_none() => {
                Err(DaqError::InvalidTriggerInfo(format!(
                    "deadtime must be supplied when trigger is {trigger}"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Reject a deadtime shorter than the hardware minimum.
    pub fn check_deadtime(&self, required: f64) -> AppResult<()> {
        match self.deadtime {
            Some(provided) if provided < required => {
                Err(DaqError::InsufficientDeadtime { required, provided })
            }
            _ => Ok(()),
        }
    }

    /// Extra time to allow for one frame on top of the stall timeout.
    pub fn frame_period(&self) -> Duration {
        let seconds = self.livetime.unwrap_or(0.0) + self.deadtime.unwrap_or(0.0);
        Duration::from_secs_f64(seconds.max(0.0))
    }
}
