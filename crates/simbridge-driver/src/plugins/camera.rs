//! Cameras → `Image` (`bgra8`).

use simbridge_hal::{DeviceHandle, DeviceReading};
use simbridge_middleware::{MessageBus, PublisherHandle};
use simbridge_types::{BridgeError, ImageMsg, Message, MessageSchema};

use crate::plugin::{
    DeviceConfig, DevicePlugin, InitContext, PluginFactory, StepContext, factory_fn,
    release_publisher, require_publisher,
};
use crate::plugins::{init_publisher, unexpected_reading};

/// Pixel encoding of engine camera frames.
pub const ENCODING: &str = "bgra8";

pub fn factory() -> PluginFactory {
    factory_fn(|handle: &DeviceHandle, config: &DeviceConfig| {
        Ok(Box::new(CameraPlugin::new(handle, config)) as Box<dyn DevicePlugin>)
    })
}

pub struct CameraPlugin {
    device: String,
    topic: String,
    frame_id: String,
    publisher: Option<PublisherHandle>,
}

impl CameraPlugin {
    pub fn new(handle: &DeviceHandle, config: &DeviceConfig) -> Self {
        Self {
            device: handle.name.clone(),
            topic: config.topic(),
            frame_id: config.frame_id(),
            publisher: None,
        }
    }
}

impl DevicePlugin for CameraPlugin {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<(), BridgeError> {
        self.publisher = Some(init_publisher(
            &self.device,
            ctx.bus,
            &self.topic,
            MessageSchema::Image,
        )?);
        Ok(())
    }

    fn on_step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), BridgeError> {
        let publisher = require_publisher(&self.device, &self.publisher)?;
        let frame = match ctx.engine.read(ctx.handle)? {
            DeviceReading::Image { frame } => frame,
            other => return Err(unexpected_reading(&self.device, &other)),
        };
        let row_bytes = frame.width.checked_mul(4).ok_or_else(|| {
            BridgeError::step(
                &self.device,
                format!("frame width {} overflows the row length", frame.width),
            )
        })?;
        let expected = row_bytes as usize * frame.height as usize;
        if frame.data.len() != expected {
            return Err(BridgeError::step(
                &self.device,
                format!(
                    "{}x{} frame has {} bytes, expected {expected}",
                    frame.width,
                    frame.height,
                    frame.data.len()
                ),
            ));
        }
        let msg = ImageMsg {
            header: ctx.header(&self.frame_id),
            width: frame.width,
            height: frame.height,
            encoding: ENCODING.to_string(),
            is_bigendian: false,
            step: row_bytes,
            data: frame.data,
        };
        ctx.bus
            .publish(publisher, Message::Image(msg))
            .map_err(|e| BridgeError::step(&self.device, e.to_string()))?;
        Ok(())
    }

    fn shutdown(&mut self, bus: &dyn MessageBus) -> Result<(), BridgeError> {
        release_publisher(bus, &mut self.publisher)
    }
}
