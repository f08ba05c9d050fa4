//! Test doubles shared by the driver's unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use simbridge_hal::{DeviceHandle, SimEngine};
use simbridge_middleware::{EventBus, MessageBus};
use simbridge_types::{BridgeError, DeviceDeclaration};

use crate::plugin::{DeviceConfig, DevicePlugin, InitContext, PluginFactory, StepContext, factory_fn};
use crate::plugins::register_builtins;
use crate::registry::PluginRegistry;
use crate::scheduler::{SchedulerConfig, StepScheduler};

/// What a [`ScriptedPlugin`] does when called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Succeed,
    Fail,
    Panic,
    BusFailure,
    FailInit,
    FailShutdown,
    PanicShutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Init(String),
    Step(String, u64),
    Shutdown(String),
}

/// Shared, ordered record of plugin calls.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Event>>>);

impl Journal {
    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn steps(&self, device: &str) -> Vec<u64> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Step(d, step) if d == device => Some(step),
                _ => None,
            })
            .collect()
    }

    pub fn inits(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Init(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    pub fn shutdowns(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Shutdown(d) => Some(d),
                _ => None,
            })
            .collect()
    }
}

/// Plugin that records every call and misbehaves on request.
pub struct ScriptedPlugin {
    device: String,
    behaviour: Behaviour,
    journal: Journal,
}

impl ScriptedPlugin {
    pub fn new(device: &str, behaviour: Behaviour, journal: Journal) -> Self {
        Self {
            device: device.to_string(),
            behaviour,
            journal,
        }
    }
}

impl DevicePlugin for ScriptedPlugin {
    fn init(&mut self, _ctx: &InitContext<'_>) -> Result<(), BridgeError> {
        self.journal.push(Event::Init(self.device.clone()));
        if self.behaviour == Behaviour::FailInit {
            return Err(BridgeError::InitError {
                device: self.device.clone(),
                details: "scripted refused to start".to_string(),
            });
        }
        Ok(())
    }

    fn on_step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), BridgeError> {
        self.journal.push(Event::Step(self.device.clone(), ctx.step));
        match self.behaviour {
            Behaviour::Fail => Err(BridgeError::step(&self.device, "scripted failure")),
            Behaviour::Panic => panic!("scripted panic on {}", self.device),
            Behaviour::BusFailure => Err(BridgeError::Bus("scripted bus failure".to_string())),
            _ => Ok(()),
        }
    }

    fn shutdown(&mut self, _bus: &dyn MessageBus) -> Result<(), BridgeError> {
        self.journal.push(Event::Shutdown(self.device.clone()));
        match self.behaviour {
            Behaviour::FailShutdown => Err(BridgeError::Bus("scripted shutdown failure".to_string())),
            Behaviour::PanicShutdown => panic!("scripted shutdown panic"),
            _ => Ok(()),
        }
    }
}

/// Factory producing [`ScriptedPlugin`]s; devices listed in `overrides` get
/// the given behaviour, all others succeed.
pub fn scripted_factory(journal: &Journal, overrides: &[(&str, Behaviour)]) -> PluginFactory {
    let journal = journal.clone();
    let overrides: HashMap<String, Behaviour> = overrides
        .iter()
        .map(|(name, b)| (name.to_string(), *b))
        .collect();
    factory_fn(move |handle: &DeviceHandle, _config: &DeviceConfig| {
        let behaviour = overrides
            .get(&handle.name)
            .copied()
            .unwrap_or(Behaviour::Succeed);
        Ok(Box::new(ScriptedPlugin::new(&handle.name, behaviour, journal.clone())) as Box<dyn DevicePlugin>)
    })
}

/// Started scheduler over the built-in plugins, plus the bus it publishes to.
pub fn builtin_session(
    engine: SimEngine,
    declarations: &[DeviceDeclaration],
) -> (StepScheduler<SimEngine>, EventBus) {
    let bus = EventBus::default();
    let mut registry = PluginRegistry::new();
    register_builtins(&mut registry).unwrap();
    let mut scheduler = StepScheduler::new(engine, Arc::new(bus.clone()), SchedulerConfig::default());
    let resolution = scheduler.resolve(&mut registry, declarations);
    scheduler.start(resolution).unwrap();
    (scheduler, bus)
}
