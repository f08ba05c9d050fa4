//! LEDs: apply `LedCommand`s from `<topic>/set`, publish `LedState`.

use simbridge_hal::{DeviceCommand, DeviceHandle, DeviceReading};
use simbridge_middleware::{MessageBus, PublisherHandle, Subscription};
use simbridge_types::{BridgeError, LedState, Message, MessageSchema};
use tracing::debug;

use crate::plugin::{
    DeviceConfig, DevicePlugin, InitContext, PluginFactory, StepContext, factory_fn,
    release_publisher, require_publisher,
};
use crate::plugins::{init_publisher, unexpected_reading};

pub fn factory() -> PluginFactory {
    factory_fn(|handle: &DeviceHandle, config: &DeviceConfig| {
        Ok(Box::new(LedPlugin::new(handle, config)) as Box<dyn DevicePlugin>)
    })
}

pub struct LedPlugin {
    device: String,
    topic: String,
    frame_id: String,
    publisher: Option<PublisherHandle>,
    commands: Option<Subscription>,
}

impl LedPlugin {
    pub fn new(handle: &DeviceHandle, config: &DeviceConfig) -> Self {
        Self {
            device: handle.name.clone(),
            topic: config.topic(),
            frame_id: config.frame_id(),
            publisher: None,
            commands: None,
        }
    }

    /// Topic the plugin listens on for commands.
    pub fn command_topic(&self) -> String {
        format!("{}/set", self.topic)
    }
}

impl DevicePlugin for LedPlugin {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<(), BridgeError> {
        self.publisher = Some(init_publisher(
            &self.device,
            ctx.bus,
            &self.topic,
            MessageSchema::LedState,
        )?);
        self.commands = Some(
            ctx.bus
                .subscribe(&self.command_topic(), MessageSchema::LedCommand)
                .map_err(|e| BridgeError::InitError {
                    device: self.device.clone(),
                    details: e.to_string(),
                })?,
        );
        Ok(())
    }

    fn on_step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), BridgeError> {
        let publisher = require_publisher(&self.device, &self.publisher)?;

        // Only the most recent command since the last invocation matters.
        let latest = self.commands.as_mut().and_then(Subscription::latest);
        if let Some(envelope) = latest
            && let Message::LedCommand(cmd) = envelope.message
        {
            debug!(device = %self.device, value = cmd.value, "led command");
            ctx.engine
                .command(ctx.handle, DeviceCommand::SetLed { value: cmd.value })?;
        }

        let value = match ctx.engine.read(ctx.handle)? {
            DeviceReading::Led { value } => value,
            other => return Err(unexpected_reading(&self.device, &other)),
        };
        let msg = LedState {
            header: ctx.header(&self.frame_id),
            value,
        };
        ctx.bus
            .publish(publisher, Message::LedState(msg))
            .map_err(|e| BridgeError::step(&self.device, e.to_string()))?;
        Ok(())
    }

    fn shutdown(&mut self, bus: &dyn MessageBus) -> Result<(), BridgeError> {
        self.commands = None;
        release_publisher(bus, &mut self.publisher)
    }
}
