//! `simbridge-hal` – simulation engine boundary.
//!
//! # Modules
//!
//! - [`device`] – [`DeviceHandle`], [`DeviceReading`] and [`DeviceCommand`]:
//!   the opaque handle and the typed read/command accessors every plugin
//!   uses.
//! - [`engine`] – [`SimulationEngine`]: the stepped engine contract consumed
//!   by the resolver and the scheduler.
//! - [`sim`] – [`SimEngine`]: a deterministic in-process engine for tests
//!   and headless runs.

pub mod device;
pub mod engine;
pub mod sim;

pub use device::{CameraFrame, DeviceCommand, DeviceHandle, DeviceId, DeviceReading, device_types};
pub use engine::{SimulationEngine, StepInfo};
pub use sim::{SimEngine, SimEngineBuilder};
