//! Streaming SWMR HDF5 file writing through the file plugin.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::io::HdfWriterIo;
use super::types::FileWriteMode;
use crate::config::DEFAULT_TIMEOUT;
use crate::detector::DetectorWriter;
use crate::documents::{HdfDataset, HdfDocumentComposer, StreamAsset};
use crate::error::{AppResult, DaqError};
use crate::providers::{DatasetDescriber, NameProvider, PathProvider};
use crate::signal::{
    observe_value, set_and_wait_for_value, wait_for_value_eq, DataKey, Dtype,
};
use crate::status::AsyncStatus;

/// Dataset holding the detector frames.
pub const MAIN_DATASET: &str = "/entry/data/data";

/// Chunking the plugin uses for scalar attribute datasets.
const ATTRIBUTE_CHUNK: usize = 16384;

#[derive(Default)]
struct WriterState {
    multiplier: u64,
    datasets: Vec<HdfDataset>,
    composer: Option<HdfDocumentComposer>,
    capture_status: Option<AsyncStatus>,
}

/// [`DetectorWriter`] over the HDF5 file plugin.
pub struct AdHdfWriter {
    hdf: Arc<HdfWriterIo>,
    path_provider: Arc<dyn PathProvider>,
    name_provider: NameProvider,
    describer: Arc<dyn DatasetDescriber>,
    attributes: Vec<(String, String)>,
    capture_stop_timeout: Duration,
    state: Mutex<WriterState>,
}

impl AdHdfWriter {
    /// Writer naming its main data key with `name_provider`.
    pub fn new(
        hdf: Arc<HdfWriterIo>,
        path_provider: Arc<dyn PathProvider>,
        name_provider: NameProvider,
        describer: Arc<dyn DatasetDescriber>,
    ) -> Self {
        Self {
            hdf,
            path_provider,
            name_provider,
            describer,
            attributes: Vec::new(),
            capture_stop_timeout: DEFAULT_TIMEOUT,
            state: Mutex::new(WriterState {
                multiplier: 1,
                ..WriterState::default()
            }),
        }
    }

    /// Also describe the scalar NDAttribute `name` of numpy type `dtype_numpy`.
    pub fn with_attribute(mut self, name: impl Into<String>, dtype_numpy: impl Into<String>) -> Self {
        self.attributes.push((name.into(), dtype_numpy.into()));
        self
    }

    /// Time allowed for the plugin to confirm capture stopped.
    pub fn with_capture_stop_timeout(mut self, timeout: Duration) -> Self {
        self.capture_stop_timeout = timeout;
        self
    }

    /// Plugin registers.
    pub fn hdf(&self) -> &Arc<HdfWriterIo> {
        &self.hdf
    }

    fn multiplier(&self) -> u64 {
        self.state.lock().multiplier.max(1)
    }

    async fn configure_plugin(&self) -> AppResult<()> {
        let info = self.path_provider.path_info(Some(&(self.name_provider)()));
        let hdf = &self.hdf;
        // Directory creation happens when the path is written, so depth goes first.
        hdf.create_directory.set(info.create_dir_depth).await?;
        futures::try_join!(
            hdf.chunk_size_auto.set(true),
            hdf.num_extra_dims.set(0),
            hdf.lazy_open.set(true),
            hdf.swmr_mode.set(true),
            hdf.file_path.set(info.directory_path.to_string_lossy().into_owned()),
            hdf.file_name.set(info.filename),
            hdf.file_template.set("%s/%s.h5".to_string()),
            hdf.file_write_mode.set(FileWriteMode::Stream),
            hdf.xml_file_name.set(String::new()),
        )?;
        if !hdf.file_path_exists.get_value().await? {
            return Err(DaqError::Configuration(format!(
                "file path {} for hdf plugin does not exist",
                info.directory_path.display()
            )));
        }
        Ok(())
    }

    async fn stream_docs(&self, indices_written: u64) -> AppResult<Vec<StreamAsset>> {
        self.hdf.flush_now.set(true).await?;
        if indices_written == 0 {
            return Ok(Vec::new());
        }
        let needs_composer = self.state.lock().composer.is_none();
        if needs_composer {
            // The final file name is only known once the first frame lands.
            let path = PathBuf::from(self.hdf.full_file_name.get_value().await?);
            let mut state = self.state.lock();
            let composer = HdfDocumentComposer::new(&path, &state.datasets);
            debug!(uri = composer.uri(), "composing stream resources");
            state.composer.get_or_insert(composer);
        }
        let mut state = self.state.lock();
        Ok(state
            .composer
            .as_mut()
            .map(|composer| composer.make_stream_docs(indices_written))
            .unwrap_or_default())
    }
}

#[async_trait]
impl DetectorWriter for AdHdfWriter {
    async fn open(&self, multiplier: u64) -> AppResult<BTreeMap<String, DataKey>> {
        self.state.lock().composer = None;
        self.configure_plugin().await?;

        self.hdf.num_capture.set(0).await?;
        // Capture runs until stopped; its waiting write completes only then.
        let capture_status =
            set_and_wait_for_value(&self.hdf.capture, true, DEFAULT_TIMEOUT, false).await?;

        let name = (self.name_provider)();
        let (shape, dtype_numpy, frames_per_chunk) = futures::try_join!(
            self.describer.shape(),
            self.describer.np_datatype(),
            self.hdf.num_frames_chunks.get_value(),
        )?;

        let mut chunk_shape = vec![frames_per_chunk.max(1) as usize];
        chunk_shape.extend(&shape);
        let mut datasets = vec![HdfDataset::new(&name, MAIN_DATASET, shape)
            .with_dtype(dtype_numpy)
            .with_multiplier(multiplier)
            .with_chunk_shape(chunk_shape)];
        datasets.extend(self.attributes.iter().map(|(attribute, dtype)| {
            HdfDataset::new(
                attribute,
                format!("/entry/instrument/NDAttributes/{attribute}"),
                Vec::new(),
            )
            .with_dtype(dtype.as_str())
            .with_multiplier(multiplier)
            .with_chunk_shape(vec![ATTRIBUTE_CHUNK])
        }));

        let source = self.hdf.full_file_name.source();
        let describe = datasets
            .iter()
            .map(|dataset| {
                let mut shape = if multiplier > 1 {
                    vec![multiplier as usize]
                } else {
                    Vec::new()
                };
                shape.extend(&dataset.shape);
                let key = DataKey {
                    source: source.clone(),
                    dtype: if dataset.shape.is_empty() {
                        Dtype::Number
                    } else {
                        Dtype::Array
                    },
                    dtype_numpy: dataset.dtype_numpy.clone(),
                    shape,
                    external: Some("STREAM:".to_string()),
                    ..DataKey::default()
                };
                (dataset.data_key.clone(), key)
            })
            .collect();

        info!(writer = %name, multiplier, datasets = datasets.len(), "hdf writer opened");
        let mut state = self.state.lock();
        state.multiplier = multiplier.max(1);
        state.datasets = datasets;
        state.capture_status = Some(capture_status);
        Ok(describe)
    }

    fn observe_indices_written(&self, timeout: Duration) -> BoxStream<'_, AppResult<u64>> {
        let multiplier = self.multiplier();
        let mut last: Option<u64> = None;
        observe_value(self.hdf.num_captured.as_ref(), Some(timeout))
            .filter_map(move |captured| {
                let item = match captured {
                    Ok(frames) => {
                        let index = frames.max(0) as u64 / multiplier;
                        if last == Some(index) {
                            None
                        } else {
                            last = Some(index);
                            Some(Ok(index))
                        }
                    }
                    Err(DaqError::ValueTimeout { .. }) => Some(Err(DaqError::WriteStallTimeout {
                        timeout,
                        last_index: last.unwrap_or(0),
                    })),
                    Err(e) => Some(Err(e)),
                };
                future::ready(item)
            })
            .boxed()
    }

    async fn get_indices_written(&self) -> AppResult<u64> {
        let captured = self.hdf.num_captured.get_value().await?;
        Ok(captured.max(0) as u64 / self.multiplier())
    }

    fn collect_stream_docs(&self, indices_written: u64) -> BoxStream<'_, AppResult<StreamAsset>> {
        stream::once(self.stream_docs(indices_written))
            .flat_map(|result| {
                let items: Vec<AppResult<StreamAsset>> = match result {
                    Ok(docs) => docs.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(items)
            })
            .boxed()
    }

    async fn close(&self) -> AppResult<()> {
        // The waiting write from open is still outstanding on Capture.
        self.hdf.capture.put(false, false, None).await?;
        wait_for_value_eq(self.hdf.capture.as_ref(), false, Some(self.capture_stop_timeout))
            .await
            .map_err(|e| match e {
                DaqError::ValueTimeout { timeout, .. } => DaqError::CaptureStopTimeout { timeout },
                other => other,
            })?;
        let capture_status = self.state.lock().capture_status.take();
        if let Some(status) = capture_status {
            status.wait().await?;
        }
        debug!(hdf = %self.hdf.capture.name(), "capture stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::areadetector::{AdBaseDataType, AdBaseIo, AdDatasetDescriber};
    use crate::device::{ConnectOptions, Connectable};
    use crate::providers::{StaticFilenameProvider, StaticPathProvider};
    use crate::signal::InMemoryTransport;

    async fn writer() -> (AdHdfWriter, Arc<HdfWriterIo>) {
        let transport = Arc::new(InMemoryTransport::new("ca"));
        let driver = Arc::new(AdBaseIo::new(transport.clone(), "CAM:").unwrap());
        let hdf = Arc::new(HdfWriterIo::new(transport, "CAM:HDF5:").unwrap());
        driver.set_name("det.drv");
        hdf.set_name("det.hdf");
        driver.connect(ConnectOptions::mock()).await.unwrap();
        hdf.connect(ConnectOptions::mock()).await.unwrap();

        driver.array_size_x.mock().unwrap().set_value(20);
        driver.array_size_y.mock().unwrap().set_value(10);
        driver.data_type.mock().unwrap().set_value(AdBaseDataType::UInt16);
        hdf.file_path_exists.mock().unwrap().set_value(true);
        hdf.num_frames_chunks.mock().unwrap().set_value(4);
        hdf.full_file_name
            .mock()
            .unwrap()
            .set_value("/data/visit/scan.h5".to_string());

        let writer = AdHdfWriter::new(
            hdf.clone(),
            Arc::new(StaticPathProvider::new(
                Arc::new(StaticFilenameProvider::new("scan")),
                "/data/visit",
            )),
            Arc::new(|| "det".to_string()),
            Arc::new(AdDatasetDescriber::new(driver)),
        )
        .with_attribute("sum", "<f8");
        (writer, hdf)
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_capture_reports_last_index() {
        let (writer, hdf) = writer().await;
        writer.open(2).await.unwrap();
        let stall = Duration::from_millis(500);
        let mut indices = writer.observe_indices_written(stall);
        assert_eq!(indices.next().await.unwrap().unwrap(), 0);

        hdf.num_captured.mock().unwrap().set_value(2);
        assert_eq!(indices.next().await.unwrap().unwrap(), 1);

        match indices.next().await {
            Some(Err(DaqError::WriteStallTimeout {
                timeout,
                last_index,
            })) => {
                assert_eq!(timeout, stall);
                assert_eq!(last_index, 1);
            }
            other => panic!("expected a write stall, got {other:?}"),
        }
        assert!(indices.next().await.is_none());
    }

    #[tokio::test]
    async fn open_configures_plugin_and_describes() {
        let (writer, hdf) = writer().await;
        let describe = writer.open(2).await.unwrap();

        assert_eq!(hdf.file_path.get_value().await.unwrap(), "/data/visit");
        assert_eq!(hdf.file_template.get_value().await.unwrap(), "%s/%s.h5");
        assert_eq!(hdf.file_write_mode.get_value().await.unwrap(), FileWriteMode::Stream);
        assert!(hdf.capture.get_value().await.unwrap());
        assert!(hdf.swmr_mode.get_value().await.unwrap());

        let main = &describe["det"];
        assert_eq!(main.shape, vec![2, 10, 20]);
        assert_eq!(main.dtype, Dtype::Array);
        assert_eq!(main.dtype_numpy, "<u2");
        assert_eq!(main.external.as_deref(), Some("STREAM:"));
        assert_eq!(describe["sum"].shape, vec![2]);
        assert_eq!(describe["sum"].dtype, Dtype::Number);
    }

    #[tokio::test]
    async fn missing_directory_fails_open() {
        let (writer, hdf) = writer().await;
        hdf.file_path_exists.mock().unwrap().set_value(false);
        assert!(matches!(
            writer.open(1).await,
            Err(DaqError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn indices_are_divided_by_multiplier() {
        let (writer, hdf) = writer().await;
        writer.open(2).await.unwrap();
        let captured = hdf.num_captured.mock().unwrap();
        let mut indices = writer.observe_indices_written(Duration::from_secs(1));
        assert_eq!(indices.next().await.unwrap().unwrap(), 0);
        captured.set_value(1);
        captured.set_value(4);
        assert_eq!(indices.next().await.unwrap().unwrap(), 2);
        assert_eq!(writer.get_indices_written().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn resources_built_lazily_from_file_name() {
        let (writer, hdf) = writer().await;
        writer.open(1).await.unwrap();
        let none: Vec<_> = writer.collect_stream_docs(0).collect().await;
        assert!(none.is_empty());

        let docs: Vec<StreamAsset> = writer
            .collect_stream_docs(3)
            .map(|d| d.unwrap())
            .collect()
            .await;
        assert_eq!(docs.len(), 4);
        let StreamAsset::StreamResource(resource) = &docs[0] else {
            panic!("resource must come first");
        };
        assert_eq!(resource.uri, "file://localhost/data/visit/scan.h5");
        assert_eq!(resource.parameters.chunk_shape, vec![4, 10, 20]);
        assert!(hdf.flush_now.get_value().await.unwrap());
    }

    #[tokio::test]
    async fn close_stops_capture_and_settles_status() {
        let (writer, hdf) = writer().await;
        let capture = hdf.capture.mock().unwrap();
        capture.set_put_proceeds(false);
        writer.open(1).await.unwrap();
        assert!(hdf.capture.get_value().await.unwrap());

        capture.set_put_proceeds(true);
        writer.close().await.unwrap();
        assert!(!hdf.capture.get_value().await.unwrap());
        let writes: Vec<bool> = capture.put_calls().into_iter().map(|c| c.value).collect();
        assert_eq!(writes, vec![true, false]);
    }
}
