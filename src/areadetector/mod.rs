//! Area detector support built entirely from signals.
//!
//! An area detector is a driver ([`AdBaseIo`]) producing frames and a file
//! plugin ([`HdfWriterIo`]) streaming them into an SWMR HDF5 file. The
//! [`AdController`] and [`AdHdfWriter`] implement the detector capabilities
//! over those registers, and [`AreaDetector`] assembles both into a
//! [`StandardDetector`](crate::detector::StandardDetector).

mod controller;
mod detector;
mod io;
mod types;
mod writer;

pub use controller::{
    AdController, AdDatasetDescriber, TriggerModeTable, DEFAULT_READOUT_TIME, UNBOUNDED_FRAMES,
};
pub use detector::{AreaDetector, AreaDetectorBuilder};
pub use io::{AdBaseIo, HdfWriterIo};
pub use types::{AdBaseDataType, DetectorState, FileWriteMode, ImageMode, DEFAULT_GOOD_STATES};
pub use writer::{AdHdfWriter, MAIN_DATASET};
