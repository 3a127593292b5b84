//! One controller plus one writer driven through an acquisition.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::controller::DetectorController;
use super::trigger::{DetectorTrigger, TriggerInfo};
use super::writer::DetectorWriter;
use crate::config::DetectorConfig;
use crate::device::{impl_connectable_via_device, ConnectOptions, Connectable, Device};
use crate::documents::StreamAsset;
use crate::error::{AppResult, DaqError};
use crate::signal::DataKey;
use crate::status::{ProgressSender, WatchableStatus, WatcherUpdate};

#[derive(Debug, Default)]
struct AcquisitionState {
    trigger_info: Option<TriggerInfo>,
    describe: BTreeMap<String, DataKey>,
    initial_index: u64,
    fly_start: Option<Instant>,
    kicked_off: bool,
}

/// Detector made of a [`DetectorController`] and a [`DetectorWriter`].
///
/// Flyscan: `stage`, `prepare`, `kickoff`, `complete`, then `collect_asset_docs`
/// as often as needed, `unstage`. Step scan: `stage`, `trigger` per point,
/// `collect_asset_docs`, `unstage`.
pub struct StandardDetector {
    device: Device,
    controller: Arc<dyn DetectorController>,
    writer: Arc<dyn DetectorWriter>,
    settings: DetectorConfig,
    state: Mutex<AcquisitionState>,
}

impl StandardDetector {
    /// Detector named `name` whose device tree holds `children`.
    pub fn new(
        name: &str,
        controller: Arc<dyn DetectorController>,
        writer: Arc<dyn DetectorWriter>,
        children: Vec<(String, Arc<dyn Connectable>)>,
    ) -> AppResult<Self> {
        let device = children
            .into_iter()
            .fold(Device::builder(), |builder, (child_name, child)| {
                builder.child(child_name, child)
            })
            .build(name)?;
        Ok(Self {
            device,
            controller,
            writer,
            settings: DetectorConfig::default(),
            state: Mutex::new(AcquisitionState::default()),
        })
    }

    /// Use timeouts and defaults from configuration.
    pub fn with_settings(mut self, settings: DetectorConfig) -> Self {
        self.settings = settings;
        self
    }

    /// Device tree of the detector.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Controller half.
    pub fn controller(&self) -> &Arc<dyn DetectorController> {
        &self.controller
    }

    /// Writer half.
    pub fn writer(&self) -> &Arc<dyn DetectorWriter> {
        &self.writer
    }

    /// Request prepared by the last `prepare`.
    pub fn trigger_info(&self) -> Option<TriggerInfo> {
        self.state.lock().trigger_info.clone()
    }

    /// Data keys returned by the writer on the last `prepare`.
    pub fn describe(&self) -> BTreeMap<String, DataKey> {
        self.state.lock().describe.clone()
    }

    /// Put the hardware in a known state before a scan.
    pub async fn stage(&self) -> AppResult<()> {
        self.stop_everything().await?;
        *self.state.lock() = AcquisitionState::default();
        debug!(detector = %self.device.name(), "staged");
        Ok(())
    }

    /// Stop acquisition and file writing after a scan.
    pub async fn unstage(&self) -> AppResult<()> {
        self.stop_everything().await?;
        self.state.lock().kicked_off = false;
        debug!(detector = %self.device.name(), "unstaged");
        Ok(())
    }

    async fn stop_everything(&self) -> AppResult<()> {
        futures::try_join!(self.writer.close(), self.controller.disarm())?;
        Ok(())
    }

    /// Configure controller and writer for one acquisition.
    pub async fn prepare(&self, trigger_info: TriggerInfo) -> AppResult<()> {
        trigger_info.validate()?;
        let required = self.controller.get_deadtime(trigger_info.livetime);
        trigger_info.check_deadtime(required)?;

        self.controller.prepare(&trigger_info).await?;
        let describe = self.writer.open(trigger_info.exposures_per_event).await?;
        let initial_index = self.writer.get_indices_written().await?;

        info!(
            detector = %self.device.name(),
            events = trigger_info.number_of_events,
            trigger = %trigger_info.trigger,
            "prepared"
        );
        let mut state = self.state.lock();
        state.trigger_info = Some(trigger_info);
        state.describe = describe;
        state.initial_index = initial_index;
        state.kicked_off = false;
        Ok(())
    }

    /// Arm the controller for a prepared flyscan.
    pub async fn kickoff(&self) -> AppResult<()> {
        if self.state.lock().trigger_info.is_none() {
            return Err(DaqError::InvalidState {
                operation: "kickoff",
                state: "not prepared".into(),
            });
        }
        self.controller.arm().await?;
        let mut state = self.state.lock();
        state.fly_start = Some(Instant::now());
        state.kicked_off = true;
        info!(detector = %self.device.name(), "kicked off");
        Ok(())
    }

    /// Wait for the kicked-off acquisition, publishing frames written.
    ///
    /// Finishes once the controller is idle and every requested event is
    /// written, then closes the writer. An unbounded acquisition finishes
    /// when the controller goes idle, normally after `disarm`.
    pub fn complete(self: &Arc<Self>) -> AppResult<WatchableStatus> {
        let (trigger_info, initial_index, fly_start) = {
            let state = self.state.lock();
            match (&state.trigger_info, state.kicked_off) {
                (Some(info), true) => (
                    info.clone(),
                    state.initial_index,
                    state.fly_start.unwrap_or_else(Instant::now),
                ),
                _ => {
                    return Err(DaqError::InvalidState {
                        operation: "complete",
                        state: "not kicked off".into(),
                    })
                }
            }
        };
        let this = Arc::clone(self);
        let name = format!("{} complete", self.device.name());
        Ok(WatchableStatus::spawn(name, move |progress| async move {
            let target = if trigger_info.is_unbounded() {
                None
            } else {
                Some(initial_index + trigger_info.number_of_events)
            };
            let timeout = this.frame_timeout(&trigger_info);
            let tracking = this.track_progress(initial_index, target, timeout, fly_start, &progress);

            let result = match target {
                Some(_) => futures::try_join!(this.controller.wait_for_idle(), tracking).map(|_| ()),
                None => tokio::select! {
                    idle = this.controller.wait_for_idle() => idle,
                    tracked = tracking => tracked,
                },
            };
            this.state.lock().kicked_off = false;
            if let Err(e) = &result {
                warn!(detector = %this.device.name(), error = %e, "acquisition failed");
                return result;
            }
            this.writer.close().await?;
            info!(detector = %this.device.name(), "acquisition complete");
            Ok(())
        }))
    }

    async fn track_progress(
        &self,
        initial_index: u64,
        target: Option<u64>,
        timeout: Duration,
        started: Instant,
        progress: &ProgressSender,
    ) -> AppResult<()> {
        let mut indices = self.writer.observe_indices_written(timeout);
        let name = self.device.name();
        while let Some(index) = indices.next().await {
            let index = index?;
            let goal = target.unwrap_or(index);
            progress.send_replace(Some(
                WatcherUpdate::new(&name, index as f64, initial_index as f64, goal as f64)
                    .with_elapsed(started.elapsed()),
            ));
            if target.is_some_and(|target| index >= target) {
                return Ok(());
            }
        }
        Err(DaqError::Cancelled(format!("{name} stopped reporting written indices")))
    }

    /// Take one step-scan point.
    ///
    /// Prepares a single internally triggered event with the configured
    /// default exposure if nothing was prepared yet.
    pub async fn trigger(&self) -> AppResult<()> {
        if self.trigger_info().is_none() {
            let default = TriggerInfo::new(1).with_livetime(self.settings.default_livetime);
            self.prepare(default).await?;
        }
        let Some(trigger_info) = self.trigger_info() else {
            return Err(DaqError::InvalidState {
                operation: "trigger",
                state: "not prepared".into(),
            });
        };
        if trigger_info.trigger != DetectorTrigger::Internal {
            return Err(DaqError::InvalidState {
                operation: "trigger",
                state: format!("prepared for {} triggering", trigger_info.trigger),
            });
        }

        let start = self.writer.get_indices_written().await?;
        let timeout = self.frame_timeout(&trigger_info);
        let mut indices = self.writer.observe_indices_written(timeout);
        self.controller.arm().await?;
        self.controller.wait_for_idle().await?;
        while let Some(index) = indices.next().await {
            if index? > start {
                debug!(detector = %self.device.name(), "step written");
                return Ok(());
            }
        }
        Err(DaqError::Cancelled(format!(
            "{} stopped reporting written indices",
            self.device.name()
        )))
    }

    /// Written index right now.
    pub async fn get_index(&self) -> AppResult<u64> {
        self.writer.get_indices_written().await
    }

    /// Resource and datum documents up to `index`, or up to what is written
    /// now when `index` is `None`.
    pub async fn collect_asset_docs(&self, index: Option<u64>) -> AppResult<Vec<StreamAsset>> {
        let indices_written = match index {
            Some(index) => index,
            None => self.writer.get_indices_written().await?,
        };
        self.writer
            .collect_stream_docs(indices_written)
            .try_collect()
            .await
    }

    /// Connect the device tree.
    pub async fn connect(&self, options: ConnectOptions) -> AppResult<()> {
        self.device.connect(options).await
    }

    fn frame_timeout(&self, trigger_info: &TriggerInfo) -> Duration {
        trigger_info
            .frame_timeout
            .unwrap_or_else(|| self.settings.frame_timeout + trigger_info.frame_period())
    }
}

impl std::fmt::Debug for StandardDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StandardDetector")
            .field("device", &self.device)
            .field("controller", &self.controller.status())
            .finish()
    }
}

impl_connectable_via_device!(StandardDetector, device);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{
        check_trigger_supported, ControllerState, ControllerStateMachine, ControllerStatus,
    };
    use crate::signal::{observe_value, Dtype, Signal};
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use tokio::sync::watch;

    /// Stays armed until disarmed, unless it takes one frame per arm.
    struct FakeController {
        machine: ControllerStateMachine,
        armed: watch::Sender<bool>,
        single_shot: Option<Arc<Signal<u64>>>,
    }

    impl FakeController {
        fn new(single_shot: Option<Arc<Signal<u64>>>) -> Self {
            Self {
                machine: ControllerStateMachine::new(),
                armed: watch::channel(false).0,
                single_shot,
            }
        }
    }

    #[async_trait]
    impl DetectorController for FakeController {
        fn get_deadtime(&self, _exposure: Option<f64>) -> f64 {
            0.002
        }

        fn supported_triggers(&self) -> Vec<DetectorTrigger> {
            vec![DetectorTrigger::Internal, DetectorTrigger::EdgeTrigger]
        }

        async fn prepare(&self, trigger_info: &TriggerInfo) -> AppResult<()> {
            self.machine.begin_prepare()?;
            let result =
                check_trigger_supported("fake", &self.supported_triggers(), trigger_info.trigger);
            self.machine.prepared(&result);
            result
        }

        async fn arm(&self) -> AppResult<()> {
            self.machine.begin_arm()?;
            self.machine.armed(&Ok(()));
            match &self.single_shot {
                Some(frames) => {
                    let taken = frames.get_value().await?;
                    frames.set(taken + 1).await?;
                    self.machine.idle();
                }
                None => {
                    self.armed.send_replace(true);
                }
            }
            Ok(())
        }

        async fn wait_for_idle(&self) -> AppResult<()> {
            let mut armed = self.armed.subscribe();
            armed
                .wait_for(|armed| !*armed)
                .await
                .map_err(|_| DaqError::Cancelled("fake controller".into()))?;
            self.machine.idle();
            Ok(())
        }

        async fn disarm(&self) -> AppResult<()> {
            self.armed.send_replace(false);
            self.machine.idle();
            Ok(())
        }

        fn status(&self) -> ControllerStatus {
            self.machine.status()
        }
    }

    struct FakeWriter {
        written: Arc<Signal<u64>>,
        closes: Mutex<u32>,
        composer: Mutex<Option<crate::documents::HdfDocumentComposer>>,
    }

    impl FakeWriter {
        fn new() -> Self {
            Self {
                written: Arc::new(Signal::soft_rw(0u64)),
                closes: Mutex::new(0),
                composer: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl DetectorWriter for FakeWriter {
        async fn open(&self, _multiplier: u64) -> AppResult<BTreeMap<String, DataKey>> {
            let dataset = crate::documents::HdfDataset::new("det", "/entry/data/data", vec![4]);
            *self.composer.lock() = Some(crate::documents::HdfDocumentComposer::new(
                std::path::Path::new("/tmp/det.h5"),
                &[dataset],
            ));
            let mut key = DataKey::for_value("fake", &0u64, &Default::default());
            key.dtype = Dtype::Array;
            key.external = Some("STREAM:".into());
            Ok(BTreeMap::from([("det".to_string(), key)]))
        }

        fn observe_indices_written(&self, timeout: Duration) -> BoxStream<'_, AppResult<u64>> {
            observe_value(self.written.as_ref(), Some(timeout))
                .map(move |item| {
                    item.map_err(|_| DaqError::WriteStallTimeout {
                        timeout,
                        last_index: 0,
                    })
                })
                .boxed()
        }

        async fn get_indices_written(&self) -> AppResult<u64> {
            self.written.get_value().await
        }

        fn collect_stream_docs(&self, indices_written: u64) -> BoxStream<'_, AppResult<StreamAsset>> {
            let docs = self
                .composer
                .lock()
                .as_mut()
                .map(|c| c.make_stream_docs(indices_written))
                .unwrap_or_default();
            futures::stream::iter(docs.into_iter().map(Ok)).boxed()
        }

        async fn close(&self) -> AppResult<()> {
            *self.closes.lock() += 1;
            Ok(())
        }
    }

    fn detector() -> (Arc<StandardDetector>, Arc<FakeController>, Arc<FakeWriter>) {
        let controller = Arc::new(FakeController::new(None));
        let writer = Arc::new(FakeWriter::new());
        let det =
            StandardDetector::new("det", controller.clone(), writer.clone(), Vec::new()).unwrap();
        (Arc::new(det), controller, writer)
    }

    #[tokio::test]
    async fn step_trigger_prepares_default_exposure() {
        let writer = Arc::new(FakeWriter::new());
        let controller = Arc::new(FakeController::new(Some(writer.written.clone())));
        let det = StandardDetector::new("det", controller.clone(), writer.clone(), Vec::new())
            .unwrap()
            .with_settings(DetectorConfig {
                default_livetime: 0.5,
                ..DetectorConfig::default()
            });

        det.trigger().await.unwrap();
        det.trigger().await.unwrap();
        assert_eq!(det.trigger_info().unwrap().livetime, Some(0.5));
        assert_eq!(det.get_index().await.unwrap(), 2);
        assert_eq!(controller.status().state, ControllerState::Idle);
    }

    #[tokio::test]
    async fn step_trigger_refuses_external_preparation() {
        let (det, _, _) = detector();
        det.prepare(
            TriggerInfo::new(1)
                .with_trigger(DetectorTrigger::EdgeTrigger)
                .with_deadtime(0.01),
        )
        .await
        .unwrap();
        assert!(matches!(det.trigger().await, Err(DaqError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn prepare_rejects_short_deadtime() {
        let (det, _, _) = detector();
        let info = TriggerInfo::new(5)
            .with_trigger(DetectorTrigger::EdgeTrigger)
            .with_deadtime(0.001);
        assert!(matches!(
            det.prepare(info).await,
            Err(DaqError::InsufficientDeadtime { .. })
        ));
    }

    #[tokio::test]
    async fn kickoff_requires_prepare() {
        let (det, _, _) = detector();
        assert!(matches!(det.kickoff().await, Err(DaqError::InvalidState { .. })));
        assert!(det.complete().is_err());
    }

    #[tokio::test]
    async fn flyscan_completes_when_all_events_written() {
        let (det, controller, writer) = detector();
        det.stage().await.unwrap();
        det.prepare(TriggerInfo::new(3).with_livetime(0.01)).await.unwrap();
        assert!(det.describe()["det"].external.is_some());
        det.kickoff().await.unwrap();

        let status = det.complete().unwrap();
        for n in 1..=3 {
            writer.written.set(n).await.unwrap();
        }
        tokio::task::yield_now().await;
        controller.disarm().await.unwrap();
        status.wait().await.unwrap();

        let update = status.latest().unwrap();
        assert_eq!(update.current, 3.0);
        assert_eq!(update.target, 3.0);
        assert_eq!(*writer.closes.lock(), 2);

        let docs = det.collect_asset_docs(None).await.unwrap();
        assert_eq!(docs.len(), 2);
        assert!(det.collect_asset_docs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unbounded_acquisition_finishes_on_disarm() {
        let (det, controller, writer) = detector();
        det.prepare(TriggerInfo::new(0).with_livetime(0.01)).await.unwrap();
        det.kickoff().await.unwrap();
        let status = det.complete().unwrap();

        writer.written.set(7).await.unwrap();
        tokio::task::yield_now().await;
        assert!(!status.is_done());

        controller.disarm().await.unwrap();
        status.wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_writer_fails_complete() {
        let (det, _, _) = detector();
        det.prepare(
            TriggerInfo::new(2)
                .with_livetime(0.01)
                .with_frame_timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap();
        det.kickoff().await.unwrap();
        let err = det.complete().unwrap().wait().await.unwrap_err();
        assert!(matches!(err.root(), DaqError::WriteStallTimeout { .. }));
    }
}
