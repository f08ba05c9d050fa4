//! [`PluginInstance`] – one plugin bound to one device, plus the scheduler's
//! per-device bookkeeping.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use simbridge_hal::{DeviceHandle, SimulationEngine, StepInfo};
use simbridge_middleware::MessageBus;
use simbridge_types::BridgeError;

use crate::plugin::{DevicePlugin, StepContext};
use crate::registry::FactoryOrigin;

/// Whether the scheduler still invokes an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceStatus {
    Active,
    /// Too many consecutive step failures; never invoked again this session.
    Suspended,
}

/// A resolved, initialised device plugin.
pub struct PluginInstance {
    handle: DeviceHandle,
    children: Vec<DeviceHandle>,
    type_tag: String,
    origin: FactoryOrigin,
    period_steps: u32,
    steps_since_publish: u32,
    consecutive_failures: u32,
    invocations: u64,
    failures: u64,
    status: InstanceStatus,
    shut_down: bool,
    plugin: Box<dyn DevicePlugin>,
}

/// Snapshot of one instance for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSummary {
    pub name: String,
    pub type_tag: String,
    pub origin: FactoryOrigin,
    pub period_steps: u32,
    pub invocations: u64,
    pub failures: u64,
    pub status: InstanceStatus,
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("name", &self.handle.name)
            .field("type_tag", &self.type_tag)
            .field("period_steps", &self.period_steps)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl PluginInstance {
    /// Bind an initialised plugin.  `period_steps` is clamped to at least 1.
    pub fn new(
        handle: DeviceHandle,
        children: Vec<DeviceHandle>,
        type_tag: impl Into<String>,
        origin: FactoryOrigin,
        period_steps: u32,
        plugin: Box<dyn DevicePlugin>,
    ) -> Self {
        Self {
            handle,
            children,
            type_tag: type_tag.into(),
            origin,
            period_steps: period_steps.max(1),
            steps_since_publish: 0,
            consecutive_failures: 0,
            invocations: 0,
            failures: 0,
            status: InstanceStatus::Active,
            shut_down: false,
            plugin,
        }
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    pub fn children(&self) -> &[DeviceHandle] {
        &self.children
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn origin(&self) -> FactoryOrigin {
        self.origin
    }

    pub fn period_steps(&self) -> u32 {
        self.period_steps
    }

    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == InstanceStatus::Active
    }

    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            name: self.handle.name.clone(),
            type_tag: self.type_tag.clone(),
            origin: self.origin,
            period_steps: self.period_steps,
            invocations: self.invocations,
            failures: self.failures,
            status: self.status,
        }
    }

    /// Count one engine step.  Returns `true` (and resets the counter) when
    /// the publish period has elapsed.
    pub(crate) fn advance(&mut self) -> bool {
        self.steps_since_publish += 1;
        if self.steps_since_publish >= self.period_steps {
            self.steps_since_publish = 0;
            true
        } else {
            false
        }
    }

    /// Run `on_step` with panics caught.
    pub(crate) fn invoke(
        &mut self,
        info: &StepInfo,
        engine: &mut dyn SimulationEngine,
        bus: &dyn MessageBus,
    ) -> Result<(), BridgeError> {
        self.invocations += 1;
        let mut ctx = StepContext {
            step: info.index,
            dt: info.dt,
            time: info.time,
            elapsed: info.dt * self.period_steps,
            handle: &self.handle,
            engine,
            bus,
        };
        let plugin = &mut self.plugin;
        match catch_plugin_panic(|| plugin.on_step(&mut ctx)) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(BridgeError::StepError { details, .. })) => {
                Err(BridgeError::step(&self.handle.name, details))
            }
            Ok(Err(other)) => Err(BridgeError::step(&self.handle.name, other.to_string())),
            Err(panic) => Err(BridgeError::step(
                &self.handle.name,
                format!("plugin panicked: {panic}"),
            )),
        }
    }

    pub(crate) fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Count a failed step.  Returns `true` when this failure suspends the
    /// instance.
    pub(crate) fn record_failure(&mut self, threshold: u32) -> bool {
        self.failures += 1;
        self.consecutive_failures += 1;
        if self.status == InstanceStatus::Active && self.consecutive_failures >= threshold {
            self.status = InstanceStatus::Suspended;
            return true;
        }
        false
    }

    /// Run `shutdown` once, with panics caught.  Later calls are no-ops.
    pub(crate) fn shutdown(&mut self, bus: &dyn MessageBus) -> Result<(), BridgeError> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        shutdown_plugin(&self.handle.name, self.plugin.as_mut(), bus)
    }
}

/// Call `plugin.shutdown` in isolation, mapping failures and panics to
/// [`BridgeError::ShutdownError`].
pub(crate) fn shutdown_plugin(
    device: &str,
    plugin: &mut dyn DevicePlugin,
    bus: &dyn MessageBus,
) -> Result<(), BridgeError> {
    match catch_plugin_panic(|| plugin.shutdown(bus)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(BridgeError::ShutdownError {
            device: device.to_string(),
            details: e.to_string(),
        }),
        Err(panic) => Err(BridgeError::ShutdownError {
            device: device.to_string(),
            details: format!("plugin panicked: {panic}"),
        }),
    }
}

/// Run plugin code, turning a panic into its message.
pub(crate) fn catch_plugin_panic<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(payload.as_ref()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
