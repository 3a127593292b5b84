//! Detector acquisition: trigger requests, the controller and writer
//! capabilities, and the [`StandardDetector`] that drives both.

mod controller;
mod standard;
mod trigger;
mod writer;

pub use controller::{
    check_trigger_supported, ControllerState, ControllerStateMachine, ControllerStatus,
    DetectorController,
};
pub use standard::StandardDetector;
pub use trigger::{DetectorTrigger, TriggerInfo};
pub use writer::DetectorWriter;
