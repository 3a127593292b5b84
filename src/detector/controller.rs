//! Hardware side of an acquisition: prepare, arm, wait, disarm.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use super::trigger::{DetectorTrigger, TriggerInfo};
use crate::error::{AppResult, DaqError};

/// Lifecycle state of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    /// Not acquiring
    #[default]
    Idle,
    /// Configured for an acquisition
    Prepared,
    /// Acquiring or waiting for triggers
    Armed,
}

/// State plus the last failure, if the previous arm went wrong.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControllerStatus {
    /// Current state
    pub state: ControllerState,
    /// Error reported by the last failed prepare or arm
    pub last_error: Option<String>,
}

/// Drives detector hardware through one acquisition.
///
/// `disarm` must be safe at any time, including when nothing is armed and
/// while an earlier `arm` is still outstanding.
#[async_trait]
pub trait DetectorController: Send + Sync {
    /// Minimum gap between frames for `exposure`. Pure.
    fn get_deadtime(&self, exposure: Option<f64>) -> f64;

    /// Trigger kinds this hardware accepts.
    fn supported_triggers(&self) -> Vec<DetectorTrigger>;

    /// Configure exposure, period, trigger mode and frame count.
    ///
    /// Fails with `UnsupportedTriggerMode` for a trigger kind outside
    /// [`supported_triggers`](Self::supported_triggers). May be called again
    /// before `arm`.
    async fn prepare(&self, trigger_info: &TriggerInfo) -> AppResult<()>;

    /// Start acquiring. Returns once the hardware reports it is acquiring.
    async fn arm(&self) -> AppResult<()>;

    /// Wait until the hardware is idle again.
    async fn wait_for_idle(&self) -> AppResult<()>;

    /// Stop acquiring.
    async fn disarm(&self) -> AppResult<()>;

    /// Current state.
    fn status(&self) -> ControllerStatus;
}

/// Reject a trigger kind not in `supported`.
pub fn check_trigger_supported(
    controller: &str,
    supported: &[DetectorTrigger],
    requested: DetectorTrigger,
) -> AppResult<()> {
    if supported.contains(&requested) {
        Ok(())
    } else {
        Err(DaqError::UnsupportedTriggerMode {
            controller: controller.to_string(),
            requested,
            supported: supported.to_vec(),
        })
    }
}

/// `IDLE -> PREPARED -> ARMED -> IDLE` bookkeeping shared by controllers.
///
/// A prepared configuration survives the return to `Idle`, so a step scan
/// can arm again without preparing again.
#[derive(Debug, Default)]
pub struct ControllerStateMachine {
    status: Mutex<ControllerStatus>,
    configured: Mutex<bool>,
}

impl ControllerStateMachine {
    /// Machine starting in `Idle`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current status.
    pub fn status(&self) -> ControllerStatus {
        self.status.lock().clone()
    }

    /// Current state.
    pub fn state(&self) -> ControllerState {
        self.status.lock().state
    }

    /// Check that a prepare is allowed now.
    pub fn begin_prepare(&self) -> AppResult<()> {
        match self.state() {
            ControllerState::Armed => Err(DaqError::InvalidState {
                operation: "prepare",
                state: "armed".into(),
            }),
            _ => Ok(()),
        }
    }

    /// Check that an arm is allowed now.
    pub fn begin_arm(&self) -> AppResult<()> {
        match self.state() {
            ControllerState::Armed => Err(DaqError::InvalidState {
                operation: "arm",
                state: "already armed".into(),
            }),
            _ if !*self.configured.lock() => Err(DaqError::InvalidState {
                operation: "arm",
                state: "not prepared".into(),
            }),
            _ => Ok(()),
        }
    }

    /// Record the outcome of a prepare.
    pub fn prepared(&self, result: &AppResult<()>) {
        *self.configured.lock() = result.is_ok();
        self.record(result, ControllerState::Prepared);
    }

    /// Record the outcome of an arm.
    pub fn armed(&self, result: &AppResult<()>) {
        self.record(result, ControllerState::Armed);
    }

    /// Back to `Idle` after the acquisition finished or was stopped.
    pub fn idle(&self) {
        let mut status = self.status.lock();
        debug!(from = ?status.state, "controller idle");
        status.state = ControllerState::Idle;
    }

    fn record(&self, result: &AppResult<()>, on_success: ControllerState) {
        let mut status = self.status.lock();
        match result {
            Ok(()) => {
                status.state = on_success;
                status.last_error = None;
            }
            Err(e) => {
                status.state = ControllerState::Idle;
                status.last_error = Some(e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_trigger_names_supported_set() {
        let supported = [DetectorTrigger::Internal, DetectorTrigger::ConstantGate];
        let err =
            check_trigger_supported("ctrl", &supported, DetectorTrigger::EdgeTrigger).unwrap_err();
        match err {
            DaqError::UnsupportedTriggerMode {
                requested,
                supported,
                ..
            } => {
                assert_eq!(requested, DetectorTrigger::EdgeTrigger);
                assert_eq!(
                    supported,
                    vec![DetectorTrigger::Internal, DetectorTrigger::ConstantGate]
                );
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn failed_arm_reports_error_in_idle() {
        let machine = ControllerStateMachine::new();
        assert!(machine.begin_arm().is_err());
        machine.prepared(&Ok(()));
        machine.begin_arm().unwrap();
        machine.armed(&Err(DaqError::Transport("no reply".into())));

        let status = machine.status();
        assert_eq!(status.state, ControllerState::Idle);
        assert!(status.last_error.unwrap().contains("no reply"));
    }

    #[test]
    fn rearm_after_idle_keeps_configuration() {
        let machine = ControllerStateMachine::new();
        machine.prepared(&Ok(()));
        machine.armed(&Ok(()));
        assert!(machine.begin_arm().is_err());
        machine.idle();
        assert!(machine.begin_arm().is_ok());

        machine.prepared(&Err(DaqError::Transport("gone".into())));
        assert!(machine.begin_arm().is_err());
    }

    #[test]
    fn prepare_refused_while_armed() {
        let machine = ControllerStateMachine::new();
        machine.prepared(&Ok(()));
        machine.begin_prepare().unwrap();
        machine.armed(&Ok(()));
        assert!(machine.begin_prepare().is_err());
        machine.idle();
        assert!(machine.begin_prepare().is_ok());
    }
}
