//! Register sets of an area detector driver and its HDF5 file plugin.

use std::sync::Arc;

use super::types::{AdBaseDataType, DetectorState, FileWriteMode, ImageMode};
use crate::device::{impl_connectable_via_device, Connectable, Device};
use crate::error::AppResult;
use crate::signal::{Signal, SignalValue, Transport};

/// Builds signals on records sharing one address prefix.
struct Records {
    transport: Arc<dyn Transport>,
    prefix: String,
    children: Vec<(String, Arc<dyn Connectable>)>,
}

impl Records {
    fn new(transport: Arc<dyn Transport>, prefix: &str) -> Self {
        Self {
            transport,
            prefix: prefix.to_string(),
            children: Vec::new(),
        }
    }

    fn keep<T: SignalValue>(&mut self, name: &str, signal: Signal<T>) -> Arc<Signal<T>> {
        let signal = Arc::new(signal);
        let child: Arc<dyn Connectable> = signal.clone();
        self.children.push((name.to_string(), child));
        signal
    }

    /// Setpoint `{prefix}{suffix}` with readback `{prefix}{suffix}_RBV`.
    fn rw_rbv<T: SignalValue>(&mut self, name: &str, suffix: &str) -> Arc<Signal<T>> {
        let signal = Signal::live_rw(
            self.transport.clone(),
            format!("{}{suffix}_RBV", self.prefix),
            format!("{}{suffix}", self.prefix),
        );
        self.keep(name, signal)
    }

    /// Setpoint read back from the same record.
    fn rw<T: SignalValue>(&mut self, name: &str, suffix: &str) -> Arc<Signal<T>> {
        let address = format!("{}{suffix}", self.prefix);
        let signal = Signal::live_rw(self.transport.clone(), address.clone(), address);
        self.keep(name, signal)
    }

    fn r<T: SignalValue>(&mut self, name: &str, suffix: &str) -> Arc<Signal<T>> {
        let signal = Signal::live_r(self.transport.clone(), format!("{}{suffix}", self.prefix));
        self.keep(name, signal)
    }

    fn into_device(self, name: &str) -> AppResult<Device> {
        self.children
            .into_iter()
            .fold(Device::builder(), |builder, (child, signal)| builder.child(child, signal))
            .build(name)
    }
}

/// Driver registers shared by every area detector.
#[derive(Debug)]
pub struct AdBaseIo {
    device: Device,
    /// Start/stop acquisition; a waiting write completes when acquisition ends
    pub acquire: Arc<Signal<bool>>,
    /// Exposure of one frame in seconds
    pub acquire_time: Arc<Signal<f64>>,
    /// Time between frame starts in seconds
    pub acquire_period: Arc<Signal<f64>>,
    /// Frames per acquire in `Multiple` mode
    pub num_images: Arc<Signal<i32>>,
    /// Single, multiple or continuous acquisition
    pub image_mode: Arc<Signal<ImageMode>>,
    /// Vendor specific trigger mode label
    pub trigger_mode: Arc<Signal<String>>,
    /// State reported by the driver
    pub detector_state: Arc<Signal<DetectorState>>,
    /// Frame width in pixels
    pub array_size_x: Arc<Signal<i32>>,
    /// Frame height in pixels
    pub array_size_y: Arc<Signal<i32>>,
    /// Pixel data type
    pub data_type: Arc<Signal<AdBaseDataType>>,
    /// Frames produced since the counter was last reset
    pub array_counter: Arc<Signal<i32>>,
}

impl AdBaseIo {
    /// Driver at `prefix`, e.g. `BL01T-DI-CAM-01:DET:`.
    pub fn new(transport: Arc<dyn Transport>, prefix: &str) -> AppResult<Self> {
        let mut records = Records::new(transport, prefix);
        let acquire = records.rw_rbv("acquire", "Acquire");
        let acquire_time = records.rw_rbv("acquire_time", "AcquireTime");
        let acquire_period = records.rw_rbv("acquire_period", "AcquirePeriod");
        let num_images = records.rw_rbv("num_images", "NumImages");
        let image_mode = records.rw_rbv("image_mode", "ImageMode");
        let trigger_mode = records.rw_rbv("trigger_mode", "TriggerMode");
        let detector_state = records.r("detector_state", "DetectorState_RBV");
        let array_size_x = records.r("array_size_x", "ArraySizeX_RBV");
        let array_size_y = records.r("array_size_y", "ArraySizeY_RBV");
        let data_type = records.r("data_type", "DataType_RBV");
        let array_counter = records.rw_rbv("array_counter", "ArrayCounter");
        Ok(Self {
            device: records.into_device("")?,
            acquire,
            acquire_time,
            acquire_period,
            num_images,
            image_mode,
            trigger_mode,
            detector_state,
            array_size_x,
            array_size_y,
            data_type,
            array_counter,
        })
    }

    /// Device tree of the registers.
    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl_connectable_via_device!(AdBaseIo, device);

/// Registers of the HDF5 file plugin.
#[derive(Debug)]
pub struct HdfWriterIo {
    device: Device,
    /// Directory the plugin writes to
    pub file_path: Arc<Signal<String>>,
    /// File name without extension
    pub file_name: Arc<Signal<String>>,
    /// Whether the plugin can see `file_path`
    pub file_path_exists: Arc<Signal<bool>>,
    /// printf template combining path and name
    pub file_template: Arc<Signal<String>>,
    /// Path of the file being written, known once capture starts
    pub full_file_name: Arc<Signal<String>>,
    /// Single, capture or stream
    pub file_write_mode: Arc<Signal<FileWriteMode>>,
    /// Frames to capture, 0 for unlimited
    pub num_capture: Arc<Signal<i32>>,
    /// Frames written so far
    pub num_captured: Arc<Signal<i32>>,
    /// Single-writer multiple-reader file access
    pub swmr_mode: Arc<Signal<bool>>,
    /// Open the file on the first frame instead of on capture
    pub lazy_open: Arc<Signal<bool>>,
    /// Start/stop capture; a waiting write completes when capture ends
    pub capture: Arc<Signal<bool>>,
    /// Flush written frames to disk
    pub flush_now: Arc<Signal<bool>>,
    /// Layout XML, empty for the default layout
    pub xml_file_name: Arc<Signal<String>>,
    /// Directory levels the plugin may create
    pub create_directory: Arc<Signal<i32>>,
    /// Frames per HDF5 chunk
    pub num_frames_chunks: Arc<Signal<i32>>,
    /// Let the plugin pick chunk sizes
    pub chunk_size_auto: Arc<Signal<bool>>,
    /// Extra dimensions beyond the frame
    pub num_extra_dims: Arc<Signal<i32>>,
}

impl HdfWriterIo {
    /// Plugin at `prefix`, e.g. `BL01T-DI-CAM-01:HDF5:`.
    pub fn new(transport: Arc<dyn Transport>, prefix: &str) -> AppResult<Self> {
        let mut records = Records::new(transport, prefix);
        let file_path = records.rw_rbv("file_path", "FilePath");
        let file_name = records.rw_rbv("file_name", "FileName");
        let file_path_exists = records.r("file_path_exists", "FilePathExists_RBV");
        let file_template = records.rw_rbv("file_template", "FileTemplate");
        let full_file_name = records.r("full_file_name", "FullFileName_RBV");
        let file_write_mode = records.rw_rbv("file_write_mode", "FileWriteMode");
        let num_capture = records.rw_rbv("num_capture", "NumCapture");
        let num_captured = records.r("num_captured", "NumCaptured_RBV");
        let swmr_mode = records.rw_rbv("swmr_mode", "SWMRMode");
        let lazy_open = records.rw_rbv("lazy_open", "LazyOpen");
        let capture = records.rw_rbv("capture", "Capture");
        let flush_now = records.rw("flush_now", "FlushNow");
        let xml_file_name = records.rw_rbv("xml_file_name", "XMLFileName");
        let create_directory = records.rw("create_directory", "CreateDirectory");
        let num_frames_chunks = records.r("num_frames_chunks", "NumFramesChunks_RBV");
        let chunk_size_auto = records.rw_rbv("chunk_size_auto", "ChunkSizeAuto");
        let num_extra_dims = records.rw_rbv("num_extra_dims", "NumExtraDims");
        Ok(Self {
            device: records.into_device("")?,
            file_path,
            file_name,
            file_path_exists,
            file_template,
            full_file_name,
            file_write_mode,
            num_capture,
            num_captured,
            swmr_mode,
            lazy_open,
            capture,
            flush_now,
            xml_file_name,
            create_directory,
            num_frames_chunks,
            chunk_size_auto,
            num_extra_dims,
        })
    }

    /// Device tree of the registers.
    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl_connectable_via_device!(HdfWriterIo, device);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ConnectOptions;
    use crate::signal::InMemoryTransport;

    #[tokio::test]
    async fn registers_are_named_after_fields() {
        let transport = Arc::new(InMemoryTransport::new("ca"));
        let driver = Arc::new(AdBaseIo::new(transport, "CAM:").unwrap());
        driver.set_name("det.drv");
        assert_eq!(driver.acquire.name(), "det.drv.acquire");
        assert_eq!(driver.detector_state.name(), "det.drv.detector_state");

        driver.connect(ConnectOptions::mock()).await.unwrap();
        assert_eq!(driver.device().children().len(), 11);
        assert_eq!(
            driver.image_mode.get_value().await.unwrap(),
            ImageMode::Single
        );
    }

    #[test]
    fn readback_and_setpoint_addresses() {
        let transport = Arc::new(InMemoryTransport::new("ca"));
        let hdf = HdfWriterIo::new(transport, "CAM:HDF5:").unwrap();
        assert_eq!(hdf.capture.source(), "ca://CAM:HDF5:Capture_RBV");
        assert_eq!(hdf.flush_now.source(), "ca://CAM:HDF5:FlushNow");
        assert!(hdf.num_captured.is_read_only());
    }
}
