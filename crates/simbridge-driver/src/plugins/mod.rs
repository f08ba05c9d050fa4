//! Built-in device plugins.
//!
//! | Tag | Plugin | Publishes | Subscribes |
//! |---|---|---|---|
//! | `range` | [`range::RangePlugin`] | `Range` | – |
//! | `image` | [`camera::CameraPlugin`] | `Image` | – |
//! | `imu` | [`imu::ImuPlugin`] | `Imu` | – |
//! | `led` | [`led::LedPlugin`] | `LedState` | `<topic>/set` (`LedCommand`) |
//! | `diff_drive` | [`diff_drive::DiffDrivePlugin`] | `Odometry` | `cmd_vel_topic` (`Twist`) |

pub mod camera;
pub mod diff_drive;
pub mod imu;
pub mod led;
pub mod range;

use simbridge_hal::{DeviceReading, device_types};
use simbridge_middleware::{MessageBus, PublisherHandle};
use simbridge_types::{BridgeError, MessageSchema};

use crate::registry::PluginRegistry;

/// Register every built-in plugin under its device-type tag.
///
/// # Errors
///
/// Returns [`BridgeError::DuplicateTypeTag`] when a tag was registered
/// before.
pub fn register_builtins(registry: &mut PluginRegistry) -> Result<(), BridgeError> {
    registry.register_static(device_types::RANGE, range::factory())?;
    registry.register_static(device_types::IMAGE, camera::factory())?;
    registry.register_static(device_types::IMU, imu::factory())?;
    registry.register_static(device_types::LED, led::factory())?;
    registry.register_static(device_types::DIFF_DRIVE, diff_drive::factory())?;
    Ok(())
}

/// Step error for a reading of the wrong shape.
pub(crate) fn unexpected_reading(device: &str, reading: &DeviceReading) -> BridgeError {
    BridgeError::step(device, format!("unexpected reading {reading:?}"))
}

/// Create a publisher during `init`, reporting failures as `InitError`.
pub(crate) fn init_publisher(
    device: &str,
    bus: &dyn MessageBus,
    topic: &str,
    schema: MessageSchema,
) -> Result<PublisherHandle, BridgeError> {
    bus.create_publisher(topic, schema)
        .map_err(|e| BridgeError::InitError {
            device: device.to_string(),
            details: e.to_string(),
        })
}
