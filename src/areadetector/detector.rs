//! A driver and an HDF5 plugin assembled into a [`StandardDetector`].

use std::sync::Arc;

use async_trait::async_trait;

use super::controller::{AdController, AdDatasetDescriber, TriggerModeTable};
use super::io::{AdBaseIo, HdfWriterIo};
use super::writer::AdHdfWriter;
use crate::config::DetectorConfig;
use crate::detector::{DetectorTrigger, StandardDetector};
use crate::device::{
    impl_connectable_via_device, Connectable, DataKeyMap, Readable, ReadableFormat, Readout,
    ReadingMap,
};
use crate::error::AppResult;
use crate::providers::PathProvider;
use crate::signal::{Signal, Transport};

/// Options for [`AreaDetector::builder`].
pub struct AreaDetectorBuilder {
    transport: Arc<dyn Transport>,
    prefix: String,
    path_provider: Arc<dyn PathProvider>,
    drv_suffix: String,
    hdf_suffix: String,
    trigger_modes: TriggerModeTable,
    readout_time: Option<f64>,
    armed_suffix: Option<String>,
    attributes: Vec<(String, String)>,
    settings: DetectorConfig,
}

impl AreaDetectorBuilder {
    /// Driver records under `{prefix}{suffix}`, `cam1:` by default.
    pub fn drv_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.drv_suffix = suffix.into();
        self
    }

    /// Plugin records under `{prefix}{suffix}`, `HDF1:` by default.
    pub fn hdf_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.hdf_suffix = suffix.into();
        self
    }

    /// Trigger kinds the driver accepts, with their `TriggerMode` labels.
    pub fn trigger_modes(mut self, table: TriggerModeTable) -> Self {
        self.trigger_modes = table;
        self
    }

    /// Fixed readout time between frames.
    pub fn readout_time(mut self, seconds: f64) -> Self {
        self.readout_time = Some(seconds);
        self
    }

    /// Driver record, relative to the driver prefix, that reads true once
    /// triggers are accepted.
    pub fn armed_record(mut self, suffix: impl Into<String>) -> Self {
        self.armed_suffix = Some(suffix.into());
        self
    }

    /// Also stream the scalar NDAttribute `name`.
    pub fn attribute(mut self, name: impl Into<String>, dtype_numpy: impl Into<String>) -> Self {
        self.attributes.push((name.into(), dtype_numpy.into()));
        self
    }

    /// Timeouts and defaults.
    pub fn settings(mut self, settings: DetectorConfig) -> Self {
        self.settings = settings;
        self
    }

    /// Assemble the detector named `name`.
    pub fn build(self, name: &str) -> AppResult<AreaDetector> {
        let drv_prefix = format!("{}{}", self.prefix, self.drv_suffix);
        let driver = Arc::new(AdBaseIo::new(self.transport.clone(), &drv_prefix)?);
        let hdf = Arc::new(HdfWriterIo::new(
            self.transport.clone(),
            &format!("{}{}", self.prefix, self.hdf_suffix),
        )?);

        let mut controller = AdController::new(name, driver.clone())
            .with_trigger_modes(self.trigger_modes)
            .with_arm_timeout(self.settings.arm_timeout);
        if let Some(readout) = self.readout_time {
            controller = controller.with_readout_time(readout);
        }
        let mut children: Vec<(String, Arc<dyn Connectable>)> = Vec::new();
        if let Some(suffix) = &self.armed_suffix {
            let armed = Arc::new(Signal::<bool>::live_r(
                self.transport.clone(),
                format!("{drv_prefix}{suffix}"),
            ));
            let child: Arc<dyn Connectable> = armed.clone();
            children.push(("armed".to_string(), child));
            controller = controller.with_armed_signal(armed);
        }

        let detector_name = name.to_string();
        let mut writer = AdHdfWriter::new(
            hdf.clone(),
            self.path_provider,
            Arc::new(move || detector_name.clone()),
            Arc::new(AdDatasetDescriber::new(driver.clone())),
        )
        .with_capture_stop_timeout(self.settings.capture_stop_timeout);
        for (attribute, dtype) in self.attributes {
            writer = writer.with_attribute(attribute, dtype);
        }

        let drv: Arc<dyn Connectable> = driver.clone();
        let plugin: Arc<dyn Connectable> = hdf.clone();
        children.insert(0, ("hdf".to_string(), plugin));
        children.insert(0, ("drv".to_string(), drv));
        let detector =
            StandardDetector::new(name, Arc::new(controller), Arc::new(writer), children)?
                .with_settings(self.settings);
        let readout = Readout::new()
            .with(ReadableFormat::Config, driver.acquire_time.clone())
            .with(ReadableFormat::Config, driver.acquire_period.clone());
        Ok(AreaDetector {
            detector: Arc::new(detector),
            driver,
            hdf,
            readout,
        })
    }
}

/// Area detector writing SWMR HDF5 files.
///
/// Frames reach consumers through stream documents, so `read` is empty;
/// exposure and period are reported as configuration.
///
/// ```rust,ignore
/// let det = AreaDetector::builder(transport, "BL01T-DI-CAM-01:", path_provider)
///     .readout_time(0.001)
///     .build("saxs")?;
/// det.connect(ConnectOptions::default()).await?;
/// det.detector().prepare(TriggerInfo::new(100).with_livetime(0.01)).await?;
/// ```
pub struct AreaDetector {
    detector: Arc<StandardDetector>,
    driver: Arc<AdBaseIo>,
    hdf: Arc<HdfWriterIo>,
    readout: Readout,
}

impl AreaDetector {
    /// Start assembling a detector whose records live under `prefix`.
    pub fn builder(
        transport: Arc<dyn Transport>,
        prefix: impl Into<String>,
        path_provider: Arc<dyn PathProvider>,
    ) -> AreaDetectorBuilder {
        AreaDetectorBuilder {
            transport,
            prefix: prefix.into(),
            path_provider,
            drv_suffix: "cam1:".to_string(),
            hdf_suffix: "HDF1:".to_string(),
            trigger_modes: vec![(DetectorTrigger::Internal, "Internal".to_string())],
            readout_time: None,
            armed_suffix: None,
            attributes: Vec::new(),
            settings: DetectorConfig::default(),
        }
    }

    /// Acquisition interface.
    pub fn detector(&self) -> &Arc<StandardDetector> {
        &self.detector
    }

    /// Driver registers.
    pub fn driver(&self) -> &Arc<AdBaseIo> {
        &self.driver
    }

    /// Plugin registers.
    pub fn hdf(&self) -> &Arc<HdfWriterIo> {
        &self.hdf
    }
}

impl std::fmt::Debug for AreaDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AreaDetector")
            .field("name", &self.detector.device().name())
            .finish()
    }
}

impl_connectable_via_device!(AreaDetector, detector);

#[async_trait]
impl Readable for AreaDetector {
    async fn read(&self) -> AppResult<ReadingMap> {
        self.readout.read().await
    }

    async fn describe(&self) -> AppResult<DataKeyMap> {
        self.readout.describe().await
    }

    async fn read_configuration(&self) -> AppResult<ReadingMap> {
        self.readout.read_configuration().await
    }

    async fn describe_configuration(&self) -> AppResult<DataKeyMap> {
        self.readout.describe_configuration().await
    }

    fn hint_fields(&self) -> Vec<String> {
        self.readout.hints()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ConnectOptions;
    use crate::providers::{StaticFilenameProvider, StaticPathProvider};
    use crate::signal::InMemoryTransport;

    fn paths() -> Arc<dyn PathProvider> {
        Arc::new(StaticPathProvider::new(
            Arc::new(StaticFilenameProvider::new("frames")),
            "/tmp",
        ))
    }

    #[tokio::test]
    async fn children_named_under_detector() {
        let transport = Arc::new(InMemoryTransport::new("ca"));
        let det = AreaDetector::builder(transport, "BL01:", paths())
            .armed_record("Armed_RBV")
            .build("saxs")
            .unwrap();
        assert_eq!(det.driver().acquire.name(), "saxs.drv.acquire");
        assert_eq!(det.hdf().capture.name(), "saxs.hdf.capture");
        assert_eq!(det.driver().acquire.source(), "ca://BL01:cam1:Acquire_RBV");

        det.connect(ConnectOptions::mock()).await.unwrap();
        assert!(det.is_connected());
        let armed: Arc<Signal<bool>> = det.detector().device().child("armed").unwrap();
        assert_eq!(armed.name(), "saxs.armed");
    }

    #[tokio::test]
    async fn exposure_reported_as_configuration() {
        let transport = Arc::new(InMemoryTransport::new("ca"));
        let det = AreaDetector::builder(transport, "BL01:", paths())
            .build("saxs")
            .unwrap();
        det.connect(ConnectOptions::mock()).await.unwrap();
        det.driver().acquire_time.mock().unwrap().set_value(0.25);
        det.driver().acquire_period.mock().unwrap().set_value(0.5);

        assert!(det.read().await.unwrap().is_empty());
        let config = det.read_configuration().await.unwrap();
        assert_eq!(
            config.keys().collect::<Vec<_>>(),
            vec!["saxs.drv.acquire_period", "saxs.drv.acquire_time"]
        );
        assert_eq!(config["saxs.drv.acquire_time"].value, serde_json::json!(0.25));
        let keys = det.describe_configuration().await.unwrap();
        assert_eq!(
            keys["saxs.drv.acquire_period"].source,
            "mock+ca://BL01:cam1:AcquirePeriod_RBV"
        );
        assert!(det.hint_fields().is_empty());
    }
}
