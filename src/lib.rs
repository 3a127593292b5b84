//! # DAQ Devices
//!
//! Hardware abstraction for beamline data acquisition: typed signals, device
//! trees that connect concurrently, and detectors that stream frames into
//! files while publishing the documents that describe them.
//!
//! ## Crate Structure
//!
//! - **`signal`**: `Signal<T>`, the typed leaf of every device tree, with soft,
//!   live and mock backends, the `Transport` seam and the wait/observe helpers.
//! - **`device`**: `Device` trees, the concurrent connect protocol with
//!   aggregated failures, `DeviceVector` and `connect_all`.
//! - **`status`**: `AsyncStatus` completion handles and `WatchableStatus`
//!   progress reporting.
//! - **`detector`**: `TriggerInfo`, the `DetectorController` and
//!   `DetectorWriter` capabilities and the `StandardDetector` that drives them.
//! - **`documents`**: stream resource and datum documents for data written
//!   to SWMR HDF5 files.
//! - **`providers`**: where files go and what the data is called.
//! - **`areadetector`**: concrete controller, writer and assembly over area
//!   detector driver and file plugin registers.
//! - **`testing`**: helpers for signals connected in mock mode.
//! - **`config`**: figment-backed configuration (`DaqConfig`).
//! - **`error`**: the crate-wide `DaqError`.
//! - **`tracing_setup`**: subscriber initialisation.
//!
//! ## Example
//!
//! ```rust,ignore
//! use daq_devices::prelude::*;
//!
//! let transport: Arc<dyn Transport> = Arc::new(InMemoryTransport::new("ca"));
//! let det = AreaDetector::builder(transport, "BL01:", path_provider).build("saxs")?;
//! det.connect(ConnectOptions::default()).await?;
//!
//! let detector = det.detector();
//! detector.stage().await?;
//! detector.prepare(TriggerInfo::new(10).with_livetime(0.1)).await?;
//! detector.kickoff().await?;
//! detector.complete()?.wait().await?;
//! let docs = detector.collect_asset_docs(None).await?;
//! detector.unstage().await?;
//! ```

pub mod areadetector;
pub mod config;
pub mod detector;
pub mod device;
pub mod documents;
pub mod error;
pub mod providers;
pub mod signal;
pub mod status;
pub mod testing;
pub mod tracing_setup;

pub use error::{AppResult, DaqError};

/// Commonly used types.
pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::areadetector::AreaDetector;
    pub use crate::config::DaqConfig;
    pub use crate::detector::{
        DetectorController, DetectorTrigger, DetectorWriter, StandardDetector, TriggerInfo,
    };
    pub use crate::device::{
        ConnectOptions, Connectable, Device, Readable, ReadableFormat, StandardReadable,
    };
    pub use crate::documents::StreamAsset;
    pub use crate::error::{AppResult, DaqError};
    pub use crate::providers::{PathProvider, StaticFilenameProvider, StaticPathProvider};
    pub use crate::signal::{InMemoryTransport, Signal, Transport};
    pub use crate::status::{AsyncStatus, WatchableStatus};
}
