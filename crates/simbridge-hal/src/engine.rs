//! Generic `SimulationEngine` trait.
//!
//! The engine is a single-threaded, stepped API: the scheduler calls
//! [`SimulationEngine::step`] once per tick and plugins read or command
//! devices in between.  The rest of the bridge only ever talks to this trait,
//! so the in-process [`SimEngine`][crate::sim::SimEngine] and a real
//! simulator binding can be swapped freely.

use std::time::Duration;

use simbridge_types::BridgeError;

use crate::device::{DeviceCommand, DeviceHandle, DeviceReading};

/// Result of advancing the simulation by one basic time step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepInfo {
    /// New step index; the first step is `1`.
    pub index: u64,
    /// Simulated time elapsed during this step.
    pub dt: Duration,
    /// Total simulated time after this step.
    pub time: Duration,
}

/// A stepped simulation engine that owns every device.
pub trait SimulationEngine {
    /// Advance the simulation by one basic time step.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::SimulationEnded`] when the simulation has
    /// reached its end and [`BridgeError::Engine`] when it failed; in both
    /// cases the caller must not step again.
    fn step(&mut self) -> Result<StepInfo, BridgeError>;

    /// Look up a device by name.
    fn device(&self, name: &str) -> Option<DeviceHandle>;

    /// Read the current value of a device.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::StepError`] when the device cannot be read.
    fn read(&self, handle: &DeviceHandle) -> Result<DeviceReading, BridgeError>;

    /// Send a command to an actuator-class device.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::StepError`] when the device does not accept the
    /// command.
    fn command(&mut self, handle: &DeviceHandle, command: DeviceCommand) -> Result<(), BridgeError>;

    /// Length of one simulation step.
    fn basic_time_step(&self) -> Duration;
}
