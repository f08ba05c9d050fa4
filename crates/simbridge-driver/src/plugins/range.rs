//! Distance sensors (infrared proximity, time-of-flight) → `Range`.

use simbridge_hal::{DeviceHandle, DeviceReading};
use simbridge_middleware::{MessageBus, PublisherHandle};
use simbridge_types::{BridgeError, Message, MessageSchema, RadiationType, RangeMsg};

use crate::plugin::{
    DeviceConfig, DevicePlugin, InitContext, PluginFactory, StepContext, factory_fn,
    release_publisher, require_publisher,
};
use crate::plugins::{init_publisher, unexpected_reading};

pub fn factory() -> PluginFactory {
    factory_fn(|handle: &DeviceHandle, config: &DeviceConfig| {
        Ok(Box::new(RangePlugin::new(handle, config)) as Box<dyn DevicePlugin>)
    })
}

pub struct RangePlugin {
    device: String,
    topic: String,
    frame_id: String,
    publisher: Option<PublisherHandle>,
}

impl RangePlugin {
    pub fn new(handle: &DeviceHandle, config: &DeviceConfig) -> Self {
        Self {
            device: handle.name.clone(),
            topic: config.topic(),
            frame_id: config.frame_id(),
            publisher: None,
        }
    }
}

impl DevicePlugin for RangePlugin {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<(), BridgeError> {
        self.publisher = Some(init_publisher(
            &self.device,
            ctx.bus,
            &self.topic,
            MessageSchema::Range,
        )?);
        Ok(())
    }

    fn on_step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), BridgeError> {
        let publisher = require_publisher(&self.device, &self.publisher)?;
        let msg = match ctx.engine.read(ctx.handle)? {
            DeviceReading::Range {
                value,
                min,
                max,
                aperture,
            } => RangeMsg {
                header: ctx.header(&self.frame_id),
                radiation_type: RadiationType::Infrared,
                field_of_view: aperture,
                min_range: min,
                max_range: max,
                range: value,
            },
            other => return Err(unexpected_reading(&self.device, &other)),
        };
        ctx.bus
            .publish(publisher, Message::Range(msg))
            .map_err(|e| BridgeError::step(&self.device, e.to_string()))?;
        Ok(())
    }

    fn shutdown(&mut self, bus: &dyn MessageBus) -> Result<(), BridgeError> {
        release_publisher(bus, &mut self.publisher)
    }
}
