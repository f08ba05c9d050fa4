//! Inertial unit with optional gyro and accelerometer children → `Imu`.
//!
//! The parent device supplies roll/pitch/yaw.  A `gyro` child fills the
//! angular velocity and an `accelerometer` child the linear acceleration;
//! missing children leave those fields at zero.

use simbridge_hal::{DeviceHandle, DeviceReading, SimulationEngine, device_types};
use simbridge_middleware::{MessageBus, PublisherHandle};
use simbridge_types::{BridgeError, ImuMsg, Message, MessageSchema, Quaternion, Vector3};

use crate::plugin::{
    DeviceConfig, DevicePlugin, InitContext, PluginFactory, StepContext, factory_fn,
    release_publisher, require_publisher,
};
use crate::plugins::{init_publisher, unexpected_reading};

pub fn factory() -> PluginFactory {
    factory_fn(|handle: &DeviceHandle, config: &DeviceConfig| {
        Ok(Box::new(ImuPlugin::new(handle, config)) as Box<dyn DevicePlugin>)
    })
}

pub struct ImuPlugin {
    device: String,
    topic: String,
    frame_id: String,
    gyro: Option<DeviceHandle>,
    accelerometer: Option<DeviceHandle>,
    publisher: Option<PublisherHandle>,
}

impl ImuPlugin {
    pub fn new(handle: &DeviceHandle, config: &DeviceConfig) -> Self {
        Self {
            device: handle.name.clone(),
            topic: config.topic(),
            frame_id: config.frame_id(),
            gyro: None,
            accelerometer: None,
            publisher: None,
        }
    }

    fn read_vector(
        &self,
        engine: &dyn SimulationEngine,
        child: Option<&DeviceHandle>,
    ) -> Result<Vector3, BridgeError> {
        let Some(child) = child else {
            return Ok(Vector3::default());
        };
        match engine.read(child)? {
            DeviceReading::Vector3 { values } => Ok(Vector3::from_array(values)),
            other => Err(unexpected_reading(&child.name, &other)),
        }
    }
}

impl DevicePlugin for ImuPlugin {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<(), BridgeError> {
        self.gyro = ctx.child(device_types::GYRO).cloned();
        self.accelerometer = ctx.child(device_types::ACCELEROMETER).cloned();
        self.publisher = Some(init_publisher(
            &self.device,
            ctx.bus,
            &self.topic,
            MessageSchema::Imu,
        )?);
        Ok(())
    }

    fn on_step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), BridgeError> {
        let publisher = require_publisher(&self.device, &self.publisher)?;
        let orientation = match ctx.engine.read(ctx.handle)? {
            DeviceReading::Orientation { roll, pitch, yaw } => Quaternion::from_euler(roll, pitch, yaw),
            other => return Err(unexpected_reading(&self.device, &other)),
        };
        let angular_velocity = self
            .read_vector(&*ctx.engine, self.gyro.as_ref())
            .map_err(|e| BridgeError::step(&self.device, e.to_string()))?;
        let linear_acceleration = self
            .read_vector(&*ctx.engine, self.accelerometer.as_ref())
            .map_err(|e| BridgeError::step(&self.device, e.to_string()))?;

        let msg = ImuMsg {
            header: ctx.header(&self.frame_id),
            orientation,
            angular_velocity,
            linear_acceleration,
        };
        ctx.bus
            .publish(publisher, Message::Imu(msg))
            .map_err(|e| BridgeError::step(&self.device, e.to_string()))?;
        Ok(())
    }

    fn shutdown(&mut self, bus: &dyn MessageBus) -> Result<(), BridgeError> {
        release_publisher(bus, &mut self.publisher)
    }
}
