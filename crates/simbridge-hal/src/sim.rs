//! In-process simulation engine for tests and headless runs.
//!
//! [`SimEngine`] implements [`SimulationEngine`] with stub devices that return
//! deterministic readings.  This lets the full bridge run in unit tests and
//! CI pipelines without a simulator process.
//!
//! # Stub behaviour
//!
//! | Device | Behaviour |
//! |---|---|
//! | fixed (`with_device`, `with_range`, …) | Returns the configured reading until changed with [`SimEngine::set_reading`]. |
//! | scripted (`with_script`) | The script is called with the new step index after every step. |
//! | LED | Stores the last `SetLed` value; reads return it. |
//! | drive base | Integrates the commanded wheel velocities into the wheel encoders every step. |
//! | faulty (`with_faulty`) | Every read fails. |
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use simbridge_hal::engine::SimulationEngine;
//! use simbridge_hal::sim::SimEngine;
//!
//! let mut engine = SimEngine::builder()
//!     .time_step(Duration::from_millis(32))
//!     .with_range("ps0", 0.05)
//!     .with_led("led0")
//!     .build();
//!
//! let info = engine.step().unwrap();
//! assert_eq!(info.index, 1);
//! assert!(engine.device("ps0").is_some());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use simbridge_types::BridgeError;
use tracing::debug;

use crate::device::{
    CameraFrame, DeviceCommand, DeviceHandle, DeviceId, DeviceReading, device_types,
};
use crate::engine::{SimulationEngine, StepInfo};

/// Default basic time step, matching the e-puck world files.
pub const DEFAULT_TIME_STEP: Duration = Duration::from_millis(32);

type Script = Box<dyn FnMut(u64) -> DeviceReading>;

// ────────────────────────────────────────────────────────────────────────────
// Stub device state
// ────────────────────────────────────────────────────────────────────────────

enum SimState {
    Fixed(DeviceReading),
    Scripted { script: Script, current: DeviceReading },
    Led(i32),
    DriveBase {
        velocities: (f64, f64),
        encoders: (f64, f64),
    },
    Faulty(String),
}

struct SimDevice {
    handle: DeviceHandle,
    state: SimState,
}

impl SimDevice {
    fn advance(&mut self, index: u64, dt: Duration) {
        match &mut self.state {
            SimState::Scripted { script, current } => *current = script.as_mut()(index),
            SimState::DriveBase {
                velocities,
                encoders,
            } => {
                let dt = dt.as_secs_f64();
                encoders.0 += velocities.0 * dt;
                encoders.1 += velocities.1 * dt;
            }
            SimState::Fixed(_) | SimState::Led(_) | SimState::Faulty(_) => {}
        }
    }

    fn read(&self) -> Result<DeviceReading, BridgeError> {
        match &self.state {
            SimState::Fixed(reading) => Ok(reading.clone()),
            SimState::Scripted { current, .. } => Ok(current.clone()),
            SimState::Led(value) => Ok(DeviceReading::Led { value: *value }),
            SimState::DriveBase { encoders, .. } => Ok(DeviceReading::WheelEncoders {
                left: encoders.0,
                right: encoders.1,
            }),
            SimState::Faulty(reason) => Err(BridgeError::step(&self.handle.name, reason.clone())),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimEngine
// ────────────────────────────────────────────────────────────────────────────

/// Deterministic in-process [`SimulationEngine`].
pub struct SimEngine {
    time_step: Duration,
    step: u64,
    end_after: Option<u64>,
    devices: Vec<SimDevice>,
    by_name: HashMap<String, DeviceId>,
}

impl fmt::Debug for SimEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimEngine")
            .field("time_step", &self.time_step)
            .field("step", &self.step)
            .field("end_after", &self.end_after)
            .field("devices", &self.by_name.len())
            .finish()
    }
}

impl SimEngine {
    /// Create a new builder with no devices.
    pub fn builder() -> SimEngineBuilder {
        SimEngineBuilder::default()
    }

    /// Current step index (`0` before the first step).
    pub fn step_index(&self) -> u64 {
        self.step
    }

    /// Replace the reading of a fixed device.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DeviceNotFound`] for unknown names and
    /// [`BridgeError::InvalidState`] for devices whose value the engine
    /// computes itself.
    pub fn set_reading(&mut self, name: &str, reading: DeviceReading) -> Result<(), BridgeError> {
        let device = self.device_mut(name)?;
        match &mut device.state {
            SimState::Fixed(current) => {
                *current = reading;
                Ok(())
            }
            _ => Err(BridgeError::InvalidState(format!(
                "device '{name}' is not a fixed-reading device"
            ))),
        }
    }

    /// Last commanded wheel velocities of a drive base.
    pub fn wheel_velocities(&self, name: &str) -> Option<(f64, f64)> {
        match self.device_ref(name)?.state {
            SimState::DriveBase { velocities, .. } => Some(velocities),
            _ => None,
        }
    }

    /// Current value of an LED.
    pub fn led_value(&self, name: &str) -> Option<i32> {
        match self.device_ref(name)?.state {
            SimState::Led(value) => Some(value),
            _ => None,
        }
    }

    fn device_ref(&self, name: &str) -> Option<&SimDevice> {
        self.by_name.get(name).and_then(|id| self.devices.get(id.0))
    }

    fn device_mut(&mut self, name: &str) -> Result<&mut SimDevice, BridgeError> {
        let id = self.by_name.get(name).ok_or_else(|| BridgeError::DeviceNotFound {
            device: name.to_string(),
            details: "no such device in the simulated world".to_string(),
        })?;
        Ok(&mut self.devices[id.0])
    }

    fn resolve(&self, handle: &DeviceHandle) -> Result<&SimDevice, BridgeError> {
        self.devices
            .get(handle.id.0)
            .filter(|d| d.handle.name == handle.name)
            .ok_or_else(|| BridgeError::DeviceNotFound {
                device: handle.name.clone(),
                details: "stale device handle".to_string(),
            })
    }
}

impl SimulationEngine for SimEngine {
    fn step(&mut self) -> Result<StepInfo, BridgeError> {
        if let Some(end) = self.end_after
            && self.step >= end
        {
            return Err(BridgeError::SimulationEnded(format!("after {end} steps")));
        }
        self.step += 1;
        let index = self.step;
        let dt = self.time_step;
        for device in &mut self.devices {
            device.advance(index, dt);
        }
        debug!(step = index, "sim engine stepped");
        Ok(StepInfo {
            index,
            dt,
            time: dt * u32::try_from(index).unwrap_or(u32::MAX),
        })
    }

    fn device(&self, name: &str) -> Option<DeviceHandle> {
        self.device_ref(name).map(|d| d.handle.clone())
    }

    fn read(&self, handle: &DeviceHandle) -> Result<DeviceReading, BridgeError> {
        self.resolve(handle)?.read()
    }

    fn command(&mut self, handle: &DeviceHandle, command: DeviceCommand) -> Result<(), BridgeError> {
        self.resolve(handle)?;
        let device = &mut self.devices[handle.id.0];
        match (&mut device.state, command) {
            (SimState::Led(current), DeviceCommand::SetLed { value }) => {
                *current = value;
                Ok(())
            }
            (SimState::DriveBase { velocities, .. }, DeviceCommand::WheelVelocities { left, right }) => {
                *velocities = (left, right);
                Ok(())
            }
            (_, command) => Err(BridgeError::step(
                &handle.name,
                format!("device does not accept command {command:?}"),
            )),
        }
    }

    fn basic_time_step(&self) -> Duration {
        self.time_step
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Builder
// ────────────────────────────────────────────────────────────────────────────

/// Builder for [`SimEngine`].
///
/// Call the `with_*` methods to add the simulated devices you need, then
/// call [`build`][Self::build].  Adding a second device with an existing name
/// replaces the first.
pub struct SimEngineBuilder {
    time_step: Duration,
    end_after: Option<u64>,
    devices: Vec<(String, String, SimState)>,
}

impl Default for SimEngineBuilder {
    fn default() -> Self {
        Self {
            time_step: DEFAULT_TIME_STEP,
            end_after: None,
            devices: Vec::new(),
        }
    }
}

impl SimEngineBuilder {
    /// Set the basic time step.
    pub fn time_step(mut self, time_step: Duration) -> Self {
        self.time_step = time_step;
        self
    }

    /// Make [`SimulationEngine::step`] fail once `steps` steps have run,
    /// like a simulator whose world was closed.
    pub fn end_after(mut self, steps: u64) -> Self {
        self.end_after = Some(steps);
        self
    }

    /// Register a device of any type with a fixed reading.
    pub fn with_device(
        mut self,
        name: impl Into<String>,
        device_type: impl Into<String>,
        reading: DeviceReading,
    ) -> Self {
        self.devices
            .push((name.into(), device_type.into(), SimState::Fixed(reading)));
        self
    }

    /// Register a distance sensor reporting `value` metres.
    pub fn with_range(self, name: impl Into<String>, value: f64) -> Self {
        self.with_device(
            name,
            device_types::RANGE,
            DeviceReading::Range {
                value,
                min: 0.0,
                max: 1.0,
                aperture: 0.1,
            },
        )
    }

    /// Register a camera returning blank BGRA frames.
    pub fn with_camera(self, name: impl Into<String>, width: u32, height: u32) -> Self {
        self.with_device(
            name,
            device_types::IMAGE,
            DeviceReading::Image {
                frame: CameraFrame::blank(width, height),
            },
        )
    }

    /// Register a level inertial unit.
    pub fn with_inertial_unit(self, name: impl Into<String>) -> Self {
        self.with_device(
            name,
            device_types::IMU,
            DeviceReading::Orientation {
                roll: 0.0,
                pitch: 0.0,
                yaw: 0.0,
            },
        )
    }

    /// Register a gyro at rest.
    pub fn with_gyro(self, name: impl Into<String>) -> Self {
        self.with_device(
            name,
            device_types::GYRO,
            DeviceReading::Vector3 { values: [0.0; 3] },
        )
    }

    /// Register an accelerometer at rest (gravity on +z).
    pub fn with_accelerometer(self, name: impl Into<String>) -> Self {
        self.with_device(
            name,
            device_types::ACCELEROMETER,
            DeviceReading::Vector3 {
                values: [0.0, 0.0, 9.81],
            },
        )
    }

    /// Register an LED, initially off.
    pub fn with_led(mut self, name: impl Into<String>) -> Self {
        self.devices
            .push((name.into(), device_types::LED.to_string(), SimState::Led(0)));
        self
    }

    /// Register a differential-drive base whose wheel encoders follow the
    /// commanded wheel velocities.
    pub fn with_drive_base(mut self, name: impl Into<String>) -> Self {
        self.devices.push((
            name.into(),
            device_types::DIFF_DRIVE.to_string(),
            SimState::DriveBase {
                velocities: (0.0, 0.0),
                encoders: (0.0, 0.0),
            },
        ));
        self
    }

    /// Register a device whose reading is recomputed after every step.
    ///
    /// `initial` is returned before the first step.
    pub fn with_script(
        mut self,
        name: impl Into<String>,
        device_type: impl Into<String>,
        initial: DeviceReading,
        script: impl FnMut(u64) -> DeviceReading + 'static,
    ) -> Self {
        self.devices.push((
            name.into(),
            device_type.into(),
            SimState::Scripted {
                script: Box::new(script),
                current: initial,
            },
        ));
        self
    }

    /// Register a device whose every read fails with `reason`.
    pub fn with_faulty(
        mut self,
        name: impl Into<String>,
        device_type: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        self.devices.push((
            name.into(),
            device_type.into(),
            SimState::Faulty(reason.into()),
        ));
        self
    }

    /// Consume the builder and return the engine at step `0`.
    pub fn build(self) -> SimEngine {
        let mut devices: Vec<SimDevice> = Vec::with_capacity(self.devices.len());
        let mut by_name: HashMap<String, DeviceId> = HashMap::new();
        for (name, device_type, state) in self.devices {
            if let Some(id) = by_name.get(&name) {
                let handle = DeviceHandle::new(*id, device_type, name);
                devices[id.0] = SimDevice { handle, state };
                continue;
            }
            let id = DeviceId(devices.len());
            by_name.insert(name.clone(), id);
            devices.push(SimDevice {
                handle: DeviceHandle::new(id, device_type, name),
                state,
            });
        }
        SimEngine {
            time_step: self.time_step,
            step: 0,
            end_after: self.end_after,
            devices,
            by_name,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use simbridge_types::ErrorKind;

    #[test]
    fn step_advances_index_and_time() {
        let mut engine = SimEngine::builder()
            .time_step(Duration::from_millis(10))
            .build();
        let first = engine.step().unwrap();
        let second = engine.step().unwrap();
        assert_eq!(first.index, 1);
        assert_eq!(second.index, 2);
        assert_eq!(second.dt, Duration::from_millis(10));
        assert_eq!(second.time, Duration::from_millis(20));
        assert_eq!(engine.step_index(), 2);
    }

    #[test]
    fn device_lookup_returns_typed_handle() {
        let engine = SimEngine::builder()
            .with_range("ps0", 0.05)
            .with_camera("camera", 2, 2)
            .build();
        let ps0 = engine.device("ps0").unwrap();
        assert_eq!(ps0.device_type, device_types::RANGE);
        assert_eq!(ps0.name, "ps0");
        assert_eq!(engine.device("camera").unwrap().device_type, device_types::IMAGE);
        assert!(engine.device("tof").is_none());
    }

    #[test]
    fn fixed_reading_can_be_replaced() {
        let mut engine = SimEngine::builder().with_range("ps0", 0.05).build();
        let handle = engine.device("ps0").unwrap();
        engine
            .set_reading(
                "ps0",
                DeviceReading::Range {
                    value: 0.02,
                    min: 0.0,
                    max: 1.0,
                    aperture: 0.1,
                },
            )
            .unwrap();
        match engine.read(&handle).unwrap() {
            DeviceReading::Range { value, .. } => assert!((value - 0.02).abs() < f64::EPSILON),
            other => panic!("unexpected reading {other:?}"),
        }
    }

    #[test]
    fn scripted_device_follows_step_index() {
        let mut engine = SimEngine::builder()
            .with_script(
                "gyro",
                device_types::GYRO,
                DeviceReading::Vector3 { values: [0.0; 3] },
                |step| DeviceReading::Vector3 {
                    values: [step as f64, 0.0, 0.0],
                },
            )
            .build();
        let handle = engine.device("gyro").unwrap();
        engine.step().unwrap();
        engine.step().unwrap();
        assert_eq!(
            engine.read(&handle).unwrap(),
            DeviceReading::Vector3 {
                values: [2.0, 0.0, 0.0]
            }
        );
    }

    #[test]
    fn drive_base_integrates_wheel_velocities() {
        let mut engine = SimEngine::builder()
            .time_step(Duration::from_millis(100))
            .with_drive_base("base")
            .build();
        let handle = engine.device("base").unwrap();
        engine
            .command(
                &handle,
                DeviceCommand::WheelVelocities {
                    left: 1.0,
                    right: 2.0,
                },
            )
            .unwrap();
        engine.step().unwrap();
        engine.step().unwrap();
        match engine.read(&handle).unwrap() {
            DeviceReading::WheelEncoders { left, right } => {
                assert!((left - 0.2).abs() < 1e-9);
                assert!((right - 0.4).abs() < 1e-9);
            }
            other => panic!("unexpected reading {other:?}"),
        }
        assert_eq!(engine.wheel_velocities("base"), Some((1.0, 2.0)));
    }

    #[test]
    fn led_records_commanded_value() {
        let mut engine = SimEngine::builder().with_led("led0").build();
        let handle = engine.device("led0").unwrap();
        engine
            .command(&handle, DeviceCommand::SetLed { value: 1 })
            .unwrap();
        assert_eq!(engine.led_value("led0"), Some(1));
        assert_eq!(engine.read(&handle).unwrap(), DeviceReading::Led { value: 1 });
    }

    #[test]
    fn sensor_rejects_commands() {
        let mut engine = SimEngine::builder().with_range("ps0", 0.05).build();
        let handle = engine.device("ps0").unwrap();
        let result = engine.command(&handle, DeviceCommand::SetLed { value: 1 });
        assert!(matches!(result, Err(BridgeError::StepError { .. })));
    }

    #[test]
    fn faulty_device_read_fails() {
        let engine = SimEngine::builder()
            .with_faulty("ps7", device_types::RANGE, "sensor unplugged")
            .build();
        let handle = engine.device("ps7").unwrap();
        let err = engine.read(&handle).unwrap_err();
        assert!(err.to_string().contains("sensor unplugged"));
    }

    #[test]
    fn engine_ends_after_configured_steps() {
        let mut engine = SimEngine::builder().end_after(2).build();
        engine.step().unwrap();
        engine.step().unwrap();
        let err = engine.step().unwrap_err();
        assert!(matches!(err, BridgeError::SimulationEnded(_)));
        assert_eq!(err.kind(), ErrorKind::Engine);
    }

    #[test]
    fn stale_handle_is_rejected() {
        let engine = SimEngine::builder().with_range("ps0", 0.05).build();
        let stale = DeviceHandle::new(DeviceId(0), device_types::RANGE, "ps1");
        assert!(matches!(
            engine.read(&stale),
            Err(BridgeError::DeviceNotFound { .. })
        ));
    }

    #[test]
    fn duplicate_name_replaces_device() {
        let engine = SimEngine::builder()
            .with_range("dev", 0.05)
            .with_led("dev")
            .build();
        assert_eq!(engine.device("dev").unwrap().device_type, device_types::LED);
        assert_eq!(engine.led_value("dev"), Some(0));
    }
}
