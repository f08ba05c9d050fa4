//! `[world]` table – the simulated devices backing the in-process engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use simbridge_hal::{SimEngine, device_types};

/// e-puck camera resolution, used when a world camera gives none.
const DEFAULT_CAMERA_SIZE: (u32, u32) = (52, 39);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldConfig {
    #[serde(default)]
    pub devices: Vec<WorldDevice>,
}

/// One simulated device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldDevice {
    #[serde(rename = "type")]
    pub device_type: String,
    pub name: String,
    /// Reported distance of a `range` device, in metres.
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    /// When set, every read of this device fails with this reason.
    #[serde(default)]
    pub fault: Option<String>,
}

/// Build the engine for `devices` with the given basic time step.
pub fn build_engine(time_step: Duration, devices: &[WorldDevice]) -> Result<SimEngine, String> {
    let mut builder = SimEngine::builder().time_step(time_step);
    for device in devices {
        let name = device.name.clone();
        if let Some(reason) = &device.fault {
            builder = builder.with_faulty(name, device.device_type.clone(), reason.clone());
            continue;
        }
        builder = match device.device_type.as_str() {
            device_types::RANGE => builder.with_range(name, device.value.unwrap_or(0.0)),
            device_types::IMAGE => {
                let (w, h) = DEFAULT_CAMERA_SIZE;
                builder.with_camera(name, device.width.unwrap_or(w), device.height.unwrap_or(h))
            }
            device_types::IMU => builder.with_inertial_unit(name),
            device_types::GYRO => builder.with_gyro(name),
            device_types::ACCELEROMETER => builder.with_accelerometer(name),
            device_types::LED => builder.with_led(name),
            device_types::DIFF_DRIVE => builder.with_drive_base(name),
            other => {
                return Err(format!(
                    "world device '{}' has unsupported type '{other}'",
                    device.name
                ));
            }
        };
    }
    Ok(builder.build())
}
