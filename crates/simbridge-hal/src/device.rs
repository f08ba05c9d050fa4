//! Device handles, readings and commands.
//!
//! A [`DeviceHandle`] is an opaque, cheaply clonable reference to one device
//! owned by a [`SimulationEngine`][crate::engine::SimulationEngine].  All
//! reads and commands go back through the engine with the handle, so a
//! plugin never holds a borrow of engine internals.

use serde::{Deserialize, Serialize};

/// Device-type tags understood by the built-in plugins and the in-process
/// engine.
pub mod device_types {
    pub const RANGE: &str = "range";
    pub const IMAGE: &str = "image";
    pub const IMU: &str = "imu";
    pub const GYRO: &str = "gyro";
    pub const ACCELEROMETER: &str = "accelerometer";
    pub const LED: &str = "led";
    pub const DIFF_DRIVE: &str = "diff_drive";
}

/// Engine-assigned device index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub usize);

/// Opaque handle identifying one simulated device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub id: DeviceId,
    /// Engine-side device type, e.g. `"range"`.
    pub device_type: String,
    pub name: String,
}

impl DeviceHandle {
    pub fn new(id: DeviceId, device_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            device_type: device_type.into(),
            name: name.into(),
        }
    }
}

/// A raw image frame returned by a camera device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraFrame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// BGRA pixel data, `width * height * 4` bytes.
    pub data: Vec<u8>,
}

impl CameraFrame {
    /// An all-black BGRA frame.
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0u8; width as usize * height as usize * 4],
        }
    }
}

/// Current value of one device, as exposed by the engine's read accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceReading {
    /// Distance sensor.  All values in metres, aperture in radians.
    Range {
        value: f64,
        min: f64,
        max: f64,
        aperture: f64,
    },
    Image { frame: CameraFrame },
    /// Inertial unit roll/pitch/yaw in radians.
    Orientation { roll: f64, pitch: f64, yaw: f64 },
    /// Three-axis sensor (gyro, accelerometer).
    Vector3 { values: [f64; 3] },
    /// Wheel position sensors of a differential-drive base, in radians.
    WheelEncoders { left: f64, right: f64 },
    Led { value: i32 },
}

/// Command accepted by actuator-class devices.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceCommand {
    SetLed { value: i32 },
    /// Wheel angular velocities in rad/s.
    WheelVelocities { left: f64, right: f64 },
}
