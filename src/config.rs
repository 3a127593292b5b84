//! Configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, every key optional)
//! 2. Environment variables prefixed with `DAQ_DEVICES_`
//!
//! Durations are written in humantime notation (`"10s"`, `"250ms"`).
//!
//! # Example
//! ```no_run
//! use daq_devices::config::DaqConfig;
//!
//! let config = DaqConfig::load()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), figment::Error>(())
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};

/// Timeout used when none is given: connects, waiting puts, arm readiness.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaqConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Connect and write timeouts
    pub connection: ConnectionConfig,
    /// Acquisition timeouts and defaults
    pub detector: DetectorConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "daq-devices".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Budget for connecting a whole device tree
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Budget for a waiting put to be acknowledged
    #[serde(with = "humantime_serde")]
    pub put_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_TIMEOUT,
            put_timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Detector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Stall timeout between written frames, on top of livetime + deadtime
    #[serde(with = "humantime_serde")]
    pub frame_timeout: Duration,
    /// Exposure used by a step-scan trigger when nothing was prepared
    pub default_livetime: f64,
    /// Budget for the hardware to confirm capture stopped
    #[serde(with = "humantime_serde")]
    pub capture_stop_timeout: Duration,
    /// Budget for the hardware to report it is acquiring after arm
    #[serde(with = "humantime_serde")]
    pub arm_timeout: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            frame_timeout: DEFAULT_TIMEOUT,
            default_livetime: 0.1,
            capture_stop_timeout: DEFAULT_TIMEOUT,
            arm_timeout: DEFAULT_TIMEOUT,
        }
    }
}

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

impl DaqConfig {
    /// Load configuration from `config/daq_devices.toml` and the environment
    ///
    /// Environment variables override the file with prefix `DAQ_DEVICES_`,
    /// sections separated by a double underscore.
    /// Example: `DAQ_DEVICES_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("config/daq_devices.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    /// The provider stack, for callers that want to merge their own layers.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(DaqConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DAQ_DEVICES_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !VALID_LEVELS.contains(&level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LEVELS.join(", ")
            )));
        }

        let format = self.application.log_format.to_lowercase();
        if !VALID_FORMATS.contains(&format.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                VALID_FORMATS.join(", ")
            )));
        }

        let durations = [
            ("connection.connect_timeout", self.connection.connect_timeout),
            ("connection.put_timeout", self.connection.put_timeout),
            ("detector.frame_timeout", self.detector.frame_timeout),
            ("detector.capture_stop_timeout", self.detector.capture_stop_timeout),
            ("detector.arm_timeout", self.detector.arm_timeout),
        ];
        for (key, value) in durations {
            if value.is_zero() {
                return Err(DaqError::Configuration(format!("{key} must be positive")));
            }
        }

        let livetime = self.detector.default_livetime;
        if !livetime.is_finite() || livetime <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "detector.default_livetime must be a positive number of seconds, got {livetime}"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = DaqConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection.connect_timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [application]
            log_level = "debug"

            [detector]
            frame_timeout = "2s"
            default_livetime = 0.5
            "#
        )
        .unwrap();

        let config = DaqConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.application.name, "daq-devices");
        assert_eq!(config.detector.frame_timeout, Duration::from_secs(2));
        assert_eq!(config.detector.default_livetime, 0.5);
        assert_eq!(config.connection.put_timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    #[serial]
    fn test_missing_file_falls_back_to_defaults() {
        let config = DaqConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config, DaqConfig::default());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("daq.toml", "[application]\nlog_level = \"warn\"\n")?;
            jail.set_env("DAQ_DEVICES_APPLICATION__LOG_LEVEL", "error");
            let config = DaqConfig::load_from("daq.toml")?;
            assert_eq!(config.application.log_level, "error");
            Ok(())
        });
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = DaqConfig::default();
        config.application.log_level = "loud".into();
        assert!(config.validate().is_err());

        let mut config = DaqConfig::default();
        config.detector.frame_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = DaqConfig::default();
        config.detector.default_livetime = -1.0;
        assert!(config.validate().is_err());
    }
}
