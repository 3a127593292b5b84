//! Where writers put their files and what they call their data.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{AppResult, DaqError};

/// Directory and file name for one acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInfo {
    /// Directory the file goes into
    pub directory_path: PathBuf,
    /// File name without extension
    pub filename: String,
    /// How many missing directory levels the writer may create
    pub create_dir_depth: i32,
}

/// Produces file names.
pub trait FilenameProvider: Send + Sync {
    /// Next file name for `device_name`.
    fn filename(&self, device_name: Option<&str>) -> String;
}

/// The same name every time.
#[derive(Debug, Clone)]
pub struct StaticFilenameProvider {
    filename: String,
}

impl StaticFilenameProvider {
    /// Provider always returning `filename`.
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
        }
    }
}

impl FilenameProvider for StaticFilenameProvider {
    fn filename(&self, _device_name: Option<&str>) -> String {
        self.filename.clone()
    }
}

/// A fresh random UUID per call.
#[derive(Debug, Clone, Default)]
pub struct UuidFilenameProvider;

impl FilenameProvider for UuidFilenameProvider {
    fn filename(&self, _device_name: Option<&str>) -> String {
        Uuid::new_v4().to_string()
    }
}

/// `{base}{delimiter}{counter}`, the counter zero-padded and stepped each call.
#[derive(Debug)]
pub struct AutoIncrementFilenameProvider {
    base_filename: String,
    max_digits: usize,
    increment: u64,
    delimiter: String,
    current: Mutex<u64>,
}

impl AutoIncrementFilenameProvider {
    /// Counter starting at 0, five digits, `_` delimiter.
    pub fn new(base_filename: impl Into<String>) -> Self {
        Self {
            base_filename: base_filename.into(),
            max_digits: 5,
            increment: 1,
            delimiter: "_".into(),
            current: Mutex::new(0),
        }
    }

    /// Start counting from `value`.
    pub fn starting_at(self, value: u64) -> Self {
        *self.current.lock() = value;
        self
    }

    /// Pad the counter to `digits`.
    pub fn with_max_digits(mut self, digits: usize) -> Self {
        self.max_digits = digits;
        self
    }

    /// Step the counter by `increment`.
    pub fn with_increment(mut self, increment: u64) -> Self {
        self.increment = increment;
        self
    }

    /// Separate base name and counter with `delimiter`.
    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    /// Next name, failing once the counter no longer fits in `max_digits`.
    pub fn try_filename(&self) -> AppResult<String> {
        let mut current = self.current.lock();
        let value = *current;
        if value.to_string().len() > self.max_digits {
            return Err(DaqError::Configuration(format!(
                "auto increment value {value} exceeds {} digits",
                self.max_digits
            )));
        }
        *current += self.increment;
        Ok(format!(
            "{}{}{:0width$}",
            self.base_filename,
            self.delimiter,
            value,
            width = self.max_digits
        ))
    }
}

impl FilenameProvider for AutoIncrementFilenameProvider {
    fn filename(&self, _device_name: Option<&str>) -> String {
        match self.try_filename() {
            Ok(name) => name,
            // Out of digits: keep going with the unpadded counter.
            Err(_) => {
                let mut current = self.current.lock();
                let value = *current;
                *current += self.increment;
                format!("{}{}{value}", self.base_filename, self.delimiter)
            }
        }
    }
}

/// Produces the [`PathInfo`] of the next acquisition.
pub trait PathProvider: Send + Sync {
    /// Path for `device_name`.
    fn path_info(&self, device_name: Option<&str>) -> PathInfo;
}

/// Fixed directory, names from a [`FilenameProvider`].
pub struct StaticPathProvider {
    filename_provider: Arc<dyn FilenameProvider>,
    directory_path: PathBuf,
    create_dir_depth: i32,
}

impl StaticPathProvider {
    /// Files go into `directory_path`, which must already exist.
    pub fn new(filename_provider: Arc<dyn FilenameProvider>, directory_path: impl Into<PathBuf>) -> Self {
        Self {
            filename_provider,
            directory_path: directory_path.into(),
            create_dir_depth: 0,
        }
    }

    /// Let the writer create up to `depth` missing directory levels.
    pub fn with_create_dir_depth(mut self, depth: i32) -> Self {
        self.create_dir_depth = depth;
        self
    }
}

impl PathProvider for StaticPathProvider {
    fn path_info(&self, device_name: Option<&str>) -> PathInfo {
        PathInfo {
            directory_path: self.directory_path.clone(),
            filename: self.filename_provider.filename(device_name),
            create_dir_depth: self.create_dir_depth,
        }
    }
}

/// Name of the main data key, usually the detector name.
pub type NameProvider = Arc<dyn Fn() -> String + Send + Sync>;

/// Shape and element type of the frames a detector produces.
#[async_trait]
pub trait DatasetDescriber: Send + Sync {
    /// Numpy dtype tag of one element.
    async fn np_datatype(&self) -> AppResult<String>;

    /// Shape of one frame, slowest axis first.
    async fn shape(&self) -> AppResult<Vec<usize>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_increment_pads_and_steps() {
        let provider = AutoIncrementFilenameProvider::new("scan")
            .with_max_digits(3)
            .with_increment(2)
            .starting_at(8);
        assert_eq!(provider.filename(None), "scan_008");
        assert_eq!(provider.filename(None), "scan_010");
    }

    #[test]
    fn auto_increment_reports_overflow() {
        let provider = AutoIncrementFilenameProvider::new("f")
            .with_max_digits(1)
            .starting_at(10);
        assert!(provider.try_filename().is_err());
        assert_eq!(provider.filename(None), "f_10");
    }

    #[test]
    fn static_path_provider_combines_parts() {
        let provider = StaticPathProvider::new(
            Arc::new(StaticFilenameProvider::new("frames")),
            "/data/visit",
        )
        .with_create_dir_depth(-2);
        let info = provider.path_info(Some("det"));
        assert_eq!(info.directory_path, PathBuf::from("/data/visit"));
        assert_eq!(info.filename, "frames");
        assert_eq!(info.create_dir_depth, -2);
    }

    #[test]
    fn uuid_names_differ() {
        let provider = UuidFilenameProvider;
        assert_ne!(provider.filename(None), provider.filename(None));
    }
}
