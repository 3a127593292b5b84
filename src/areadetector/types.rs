//! Enumerated register values of area detector drivers and file plugins.

use crate::error::{AppResult, DaqError};
use crate::signal::signal_enum;

signal_enum! {
    /// How many images one acquire takes.
    pub enum ImageMode {
        Single => "Single",
        Multiple => "Multiple",
        Continuous => "Continuous",
    }
}

signal_enum! {
    /// Driver state machine as reported by `DetectorState_RBV`.
    pub enum DetectorState {
        Idle => "Idle",
        Acquire => "Acquire",
        Readout => "Readout",
        Correct => "Correct",
        Saving => "Saving",
        Aborting => "Aborting",
        Error => "Error",
        Waiting => "Waiting",
        Initializing => "Initializing",
        Disconnected => "Disconnected",
        Aborted => "Aborted",
    }
}

/// States in which a finished acquisition is considered successful.
pub const DEFAULT_GOOD_STATES: [DetectorState; 2] = [DetectorState::Idle, DetectorState::Aborted];

signal_enum! {
    /// Element type of the arrays a driver produces.
    pub enum AdBaseDataType {
        Int8 => "Int8",
        UInt8 => "UInt8",
        Int16 => "Int16",
        UInt16 => "UInt16",
        Int32 => "Int32",
        UInt32 => "UInt32",
        Int64 => "Int64",
        UInt64 => "UInt64",
        Float32 => "Float32",
        Float64 => "Float64",
        /// Blanked by drivers that do not support the configured type
        Undefined => "",
    }
}

impl AdBaseDataType {
    /// Numpy dtype tag of this element type.
    pub fn to_numpy(self) -> AppResult<&'static str> {
        let tag = match self {
            Self::Int8 => "|i1",
            Self::UInt8 => "|u1",
            Self::Int16 => "<i2",
            Self::UInt16 => "<u2",
            Self::Int32 => "<i4",
            Self::UInt32 => "<u4",
            Self::Int64 => "<i8",
            Self::UInt64 => "<u8",
            Self::Float32 => "<f4",
            Self::Float64 => "<f8",
            Self::Undefined => {
                return Err(DaqError::Configuration(
                    "area detector driver has a blank DataType, this is not supported".into(),
                ))
            }
        };
        Ok(tag)
    }
}

signal_enum! {
    /// How the file plugin groups frames into files.
    pub enum FileWriteMode {
        Single => "Single",
        Capture => "Capture",
        Stream => "Stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{Dtype, SignalValue};

    #[test]
    fn numpy_tags() {
        assert_eq!(AdBaseDataType::UInt16.to_numpy().unwrap(), "<u2");
        assert_eq!(AdBaseDataType::Int8.to_numpy().unwrap(), "|i1");
        assert_eq!(AdBaseDataType::Float64.to_numpy().unwrap(), "<f8");
        assert!(AdBaseDataType::Undefined.to_numpy().is_err());
    }

    #[test]
    fn enums_describe_their_choices() {
        assert_eq!(ImageMode::dtype(), Dtype::String);
        assert_eq!(ImageMode::choices(), vec!["Single", "Multiple", "Continuous"]);
        assert_eq!(DetectorState::default_value(), DetectorState::Idle);
        assert_eq!(
            serde_json::to_value(FileWriteMode::Stream).unwrap(),
            serde_json::json!("Stream")
        );
    }
}
