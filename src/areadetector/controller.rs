//! Driving an area detector driver through an acquisition.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info, warn};

use super::io::AdBaseIo;
use super::types::{DetectorState, ImageMode, DEFAULT_GOOD_STATES};
use crate::config::DEFAULT_TIMEOUT;
use crate::detector::{
    check_trigger_supported, ControllerStateMachine, ControllerStatus, DetectorController,
    DetectorTrigger, TriggerInfo,
};
use crate::error::{AppResult, DaqError};
use crate::providers::DatasetDescriber;
use crate::signal::{observe_value, wait_for_value_eq, Signal};
use crate::status::AsyncStatus;

/// Frame count written for an acquisition that runs until stopped.
pub const UNBOUNDED_FRAMES: i32 = 999_999;

/// Minimum gap between frames of a driver without its own readout figure.
pub const DEFAULT_READOUT_TIME: f64 = 0.002;

/// Trigger kinds a driver accepts and the `TriggerMode` label for each.
pub type TriggerModeTable = Vec<(DetectorTrigger, String)>;

/// [`DetectorController`] over the base driver registers.
///
/// `arm` writes `Acquire=1` with a waiting put whose completion marks the end
/// of the acquisition, and returns as soon as the armed signal reads true.
/// `disarm` supersedes any outstanding arm, including one still waiting for
/// the armed signal: that arm returns `Cancelled` and leaves the controller
/// idle.
pub struct AdController {
    name: String,
    driver: Arc<AdBaseIo>,
    armed_signal: Arc<Signal<bool>>,
    trigger_modes: TriggerModeTable,
    readout_time: f64,
    good_states: Vec<DetectorState>,
    arm_timeout: Duration,
    machine: ControllerStateMachine,
    arm_status: Mutex<Option<AsyncStatus>>,
    disarms: watch::Sender<u64>,
}

impl AdController {
    /// Controller accepting internal triggers only.
    pub fn new(name: impl Into<String>, driver: Arc<AdBaseIo>) -> Self {
        let armed_signal = driver.acquire.clone();
        Self {
            name: name.into(),
            driver,
            armed_signal,
            trigger_modes: vec![(DetectorTrigger::Internal, "Internal".to_string())],
            readout_time: DEFAULT_READOUT_TIME,
            good_states: DEFAULT_GOOD_STATES.to_vec(),
            arm_timeout: DEFAULT_TIMEOUT,
            machine: ControllerStateMachine::new(),
            arm_status: Mutex::new(None),
            disarms: watch::channel(0).0,
        }
    }

    /// Accept the triggers in `table`, writing each one's label to `TriggerMode`.
    pub fn with_trigger_modes(mut self, table: TriggerModeTable) -> Self {
        self.trigger_modes = table;
        self
    }

    /// Fixed readout time added between frames.
    pub fn with_readout_time(mut self, seconds: f64) -> Self {
        self.readout_time = seconds;
        self
    }

    /// Wait for `signal` instead of the acquire readback to call the driver armed.
    ///
    /// Some drivers acknowledge `Acquire` well before they accept triggers.
    /// An unnamed signal is named `{controller}.armed`.
    pub fn with_armed_signal(mut self, signal: Arc<Signal<bool>>) -> Self {
        if signal.name().is_empty() {
            signal.set_name(&format!("{}.armed", self.name));
        }
        self.armed_signal = signal;
        self
    }

    /// Final detector states that count as a successful acquisition.
    pub fn with_good_states(mut self, states: Vec<DetectorState>) -> Self {
        self.good_states = states;
        self
    }

    /// Time allowed for the driver to report armed.
    pub fn with_arm_timeout(mut self, timeout: Duration) -> Self {
        self.arm_timeout = timeout;
        self
    }

    /// Driver registers.
    pub fn driver(&self) -> &Arc<AdBaseIo> {
        &self.driver
    }

    fn trigger_mode(&self, trigger: DetectorTrigger) -> Option<&str> {
        self.trigger_modes
            .iter()
            .find(|(kind, _)| *kind == trigger)
            .map(|(_, label)| label.as_str())
    }

    async fn configure(&self, trigger_info: &TriggerInfo) -> AppResult<()> {
        check_trigger_supported(&self.name, &self.supported_triggers(), trigger_info.trigger)?;
        let num_images = match trigger_info.total_frames() {
            None => UNBOUNDED_FRAMES,
            Some(frames) => i32::try_from(frames).map_err(|_| {
                DaqError::InvalidTriggerInfo(format!("{frames} frames exceeds the driver limit"))
            })?,
        };
        let label = self.trigger_mode(trigger_info.trigger).unwrap_or_default().to_string();

        futures::try_join!(
            self.driver.num_images.set(num_images),
            self.driver.image_mode.set(ImageMode::Multiple),
            self.driver.trigger_mode.set(label),
        )?;
        if let Some(exposure) = trigger_info.livetime {
            let period = exposure + self.get_deadtime(Some(exposure));
            futures::try_join!(
                self.driver.acquire_time.set(exposure),
                self.driver.acquire_period.set(period),
            )?;
        }
        Ok(())
    }

    fn superseded(&self) -> DaqError {
        DaqError::Cancelled(format!("{}: arm superseded by disarm", self.name))
    }

    /// Write `Acquire=1` in the background and wait for the armed signal.
    ///
    /// The status of the write is stored before waiting so a concurrent
    /// disarm can cancel it.
    async fn start_acquire(&self) -> AppResult<()> {
        let mut armed = observe_value(self.armed_signal.as_ref(), None);
        let mut last = match armed.next().await {
            Some(current) => Some(current?),
            None => None,
        };
        let status = self.driver.acquire.set_status(true, None);
        *self.arm_status.lock() = Some(status);
        if last == Some(true) {
            return Ok(());
        }
        let waiting = async {
            while let Some(value) = armed.next().await {
                let value = value?;
                if value {
                    return Ok(());
                }
                last = Some(value);
            }
            Err(DaqError::Cancelled(format!(
                "{} stopped updating",
                self.armed_signal.name()
            )))
        };
        match time::timeout(self.arm_timeout, waiting).await {
            Ok(result) => result,
            Err(_) => Err(DaqError::ValueTimeout {
                signal: self.armed_signal.name(),
                expected: "true".to_string(),
                last: format!("{last:?}"),
                timeout: self.arm_timeout,
            }),
        }
    }

    async fn check_final_state(&self) -> AppResult<()> {
        let state = self.driver.detector_state.get_value().await?;
        if self.good_states.contains(&state) {
            Ok(())
        } else {
            Err(DaqError::InvalidState {
                operation: "finish acquisition",
                state: format!(
                    "final detector state {state} not in valid end states {:?}",
                    self.good_states
                ),
            })
        }
    }
}

#[async_trait]
impl DetectorController for AdController {
    fn get_deadtime(&self, _exposure: Option<f64>) -> f64 {
        self.readout_time
    }

    fn supported_triggers(&self) -> Vec<DetectorTrigger> {
        self.trigger_modes.iter().map(|(kind, _)| *kind).collect()
    }

    async fn prepare(&self, trigger_info: &TriggerInfo) -> AppResult<()> {
        self.machine.begin_prepare()?;
        let result = self.configure(trigger_info).await;
        self.machine.prepared(&result);
        if result.is_ok() {
            debug!(controller = %self.name, trigger = %trigger_info.trigger, "prepared");
        }
        result
    }

    async fn arm(&self) -> AppResult<()> {
        self.machine.begin_arm()?;
        let mut disarms = self.disarms.subscribe();
        let result = tokio::select! {
            biased;
            _ = disarms.changed() => Err(self.superseded()),
            ready = self.start_acquire() => ready,
        };
        // A disarm that lands after readiness still wins.
        let result = match result {
            Ok(()) if disarms.has_changed().unwrap_or(false) => Err(self.superseded()),
            other => other,
        };
        if result.is_err() {
            if let Some(status) = self.arm_status.lock().take() {
                status.cancel();
            }
        }
        self.machine.armed(&result);
        match &result {
            Ok(()) => info!(controller = %self.name, "armed"),
            Err(e) => warn!(controller = %self.name, error = %e, "arm failed"),
        }
        result
    }

    async fn wait_for_idle(&self) -> AppResult<()> {
        let status = self.arm_status.lock().clone();
        if let Some(status) = status {
            match status.wait().await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {
                    debug!(controller = %self.name, "arm superseded by disarm");
                }
                Err(e) => {
                    self.machine.idle();
                    return Err(e);
                }
            }
        }
        self.machine.idle();
        self.check_final_state().await
    }

    async fn disarm(&self) -> AppResult<()> {
        self.disarms.send_modify(|count| *count += 1);
        let outstanding = self.arm_status.lock().take();
        if let Some(status) = outstanding {
            if !status.is_done() {
                warn!(controller = %self.name, "disarm supersedes outstanding arm");
            }
            status.cancel();
        }
        // A waiting put is already outstanding on Acquire, so stop without one.
        self.driver.acquire.put(false, false, None).await?;
        wait_for_value_eq(self.driver.acquire.as_ref(), false, Some(self.arm_timeout)).await?;
        self.machine.idle();
        Ok(())
    }

    fn status(&self) -> ControllerStatus {
        self.machine.status()
    }
}

/// Frame shape and dtype read from the driver.
pub struct AdDatasetDescriber {
    driver: Arc<AdBaseIo>,
}

impl AdDatasetDescriber {
    /// Describer reading `driver`.
    pub fn new(driver: Arc<AdBaseIo>) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl DatasetDescriber for AdDatasetDescriber {
    async fn np_datatype(&self) -> AppResult<String> {
        let data_type = self.driver.data_type.get_value().await?;
        Ok(data_type.to_numpy()?.to_string())
    }

    async fn shape(&self) -> AppResult<Vec<usize>> {
        let (y, x) = futures::try_join!(
            self.driver.array_size_y.get_value(),
            self.driver.array_size_x.get_value(),
        )?;
        Ok(vec![y.max(0) as usize, x.max(0) as usize])
    }
}
