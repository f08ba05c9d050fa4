//! [`StepScheduler`] – drives the simulation clock and the plugin instances.
//!
//! ```text
//!   Idle ──start()──▶ Running ──stop() / engine error / stop flag──▶ Stopped
//! ```
//!
//! Each tick advances the engine by one basic time step, then walks the
//! instances in declaration order.  An instance is invoked when its publish
//! period has elapsed; its counter resets whether or not the call succeeds.
//! Failures and panics are contained per instance: after
//! `failure_threshold` consecutive failures the instance is suspended and
//! never invoked again, while every other instance keeps running.
//!
//! The [`StopHandle`] may be raised from any thread (a Ctrl-C handler, for
//! instance).  It is checked before the engine steps and between plugin
//! invocations; a raised flag ends the session once the running invocation
//! returns.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use simbridge_hal::SimulationEngine;
use simbridge_middleware::MessageBus;
use simbridge_types::{BridgeError, DeviceDeclaration, Diagnostic};
use tracing::{debug, error, info, instrument, warn};

use crate::instance::{InstanceSummary, PluginInstance};
use crate::registry::PluginRegistry;
use crate::resolver::{DescriptorResolver, Resolution};

/// Default number of consecutive step failures before suspension.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 10;

/// Scheduler tuning, read from the `[scheduler]` config table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub failure_threshold: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

impl SchedulerConfig {
    /// Effective threshold; `0` is treated as `1`.
    pub fn threshold(&self) -> u32 {
        self.failure_threshold.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

/// Cooperative cancellation flag shared with the scheduler.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What happened during one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Engine step reached by this tick.
    pub step: u64,
    /// Instances whose `on_step` ran, in invocation order.
    pub invoked: Vec<String>,
    /// Instances whose `on_step` failed.
    pub failed: Vec<String>,
    /// Instances suspended by this tick.
    pub suspended: Vec<String>,
    /// The stop flag ended the session during this tick.
    pub stopped: bool,
}

/// Owns the engine and the instances for one session.
pub struct StepScheduler<E: SimulationEngine> {
    engine: E,
    bus: Arc<dyn MessageBus>,
    config: SchedulerConfig,
    state: SchedulerState,
    instances: Vec<PluginInstance>,
    diagnostics: Vec<Diagnostic>,
    stop: StopHandle,
    step: u64,
}

impl<E: SimulationEngine> StepScheduler<E> {
    pub fn new(engine: E, bus: Arc<dyn MessageBus>, config: SchedulerConfig) -> Self {
        Self {
            engine,
            bus,
            config,
            state: SchedulerState::Idle,
            instances: Vec::new(),
            diagnostics: Vec::new(),
            stop: StopHandle::new(),
            step: 0,
        }
    }

    /// Resolve `declarations` against this scheduler's engine and bus.
    pub fn resolve(
        &self,
        registry: &mut PluginRegistry,
        declarations: &[DeviceDeclaration],
    ) -> Resolution {
        DescriptorResolver::new(&self.engine, self.bus.as_ref(), registry).resolve(declarations)
    }

    /// Handle that stops the session when raised.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Take ownership of the resolved instances and start the session.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidState`] unless the scheduler is idle.
    /// The rejected instances are shut down.
    pub fn start(&mut self, resolution: Resolution) -> Result<(), BridgeError> {
        let Resolution {
            mut instances,
            diagnostics,
        } = resolution;
        if self.state != SchedulerState::Idle {
            for instance in instances.iter_mut().rev() {
                if let Err(e) = instance.shutdown(self.bus.as_ref()) {
                    warn!(device = %instance.name(), error = %e, "shutdown of rejected instance failed");
                }
            }
            return Err(BridgeError::InvalidState(format!(
                "cannot start a scheduler that is {:?}",
                self.state
            )));
        }
        self.diagnostics.extend(diagnostics);
        self.instances = instances;
        self.state = SchedulerState::Running;
        info!(instances = self.instances.len(), "session started");
        Ok(())
    }

    /// Advance the engine by one step and invoke every due instance.
    ///
    /// # Errors
    ///
    /// [`BridgeError::InvalidState`] when not running.  An engine failure
    /// stops the session and is returned.
    #[instrument(level = "debug", skip_all, fields(step = self.step + 1))]
    pub fn tick(&mut self) -> Result<TickReport, BridgeError> {
        if self.state != SchedulerState::Running {
            return Err(BridgeError::InvalidState(format!(
                "cannot tick a scheduler that is {:?}",
                self.state
            )));
        }
        let mut report = TickReport {
            step: self.step,
            ..TickReport::default()
        };
        if self.stop.is_stop_requested() {
            report.stopped = true;
            self.stop();
            return Ok(report);
        }

        let info = match self.engine.step() {
            Ok(info) => info,
            Err(e) => {
                if matches!(e, BridgeError::SimulationEnded(_)) {
                    info!(step = self.step, "simulation ended; stopping session");
                } else {
                    error!(error = %e, "simulation engine failed; stopping session");
                }
                self.diagnostics.push(Diagnostic::from_error("engine", &e, Some(self.step + 1)));
                self.stop();
                return Err(e);
            }
        };
        self.step = info.index;
        report.step = info.index;

        let threshold = self.config.threshold();
        for instance in &mut self.instances {
            if self.stop.is_stop_requested() {
                report.stopped = true;
                break;
            }
            if !instance.is_active() || !instance.advance() {
                continue;
            }

            let name = instance.name().to_string();
            match instance.invoke(&info, &mut self.engine, self.bus.as_ref()) {
                Ok(()) => {
                    instance.record_success();
                }
                Err(e) => {
                    warn!(device = %name, step = info.index, error = %e, "device step failed");
                    self.diagnostics
                        .push(Diagnostic::from_error(name.clone(), &e, Some(info.index)));
                    report.failed.push(name.clone());
                    if instance.record_failure(threshold) {
                        let suspended = BridgeError::DeviceSuspended {
                            device: name.clone(),
                            failures: instance.consecutive_failures(),
                        };
                        warn!(device = %name, step = info.index, failures = instance.consecutive_failures(), "device suspended");
                        self.diagnostics
                            .push(Diagnostic::from_error(name.clone(), &suspended, Some(info.index)));
                        report.suspended.push(name.clone());
                    }
                }
            }
            report.invoked.push(name);
        }
        debug!(step = info.index, invoked = report.invoked.len(), "tick complete");

        if report.stopped {
            self.stop();
        }
        Ok(report)
    }

    /// Tick until the stop flag is raised, `max_ticks` ticks have run, or
    /// the engine fails; then stop.  Returns the number of ticks run.
    pub fn run(&mut self, max_ticks: Option<u64>) -> Result<u64, BridgeError> {
        let mut ticks = 0u64;
        while self.state == SchedulerState::Running {
            if max_ticks.is_some_and(|max| ticks >= max) || self.stop.is_stop_requested() {
                break;
            }
            let before = self.step;
            let report = self.tick()?;
            if self.step > before {
                ticks += 1;
            }
            if report.stopped {
                break;
            }
        }
        self.stop();
        Ok(ticks)
    }

    /// Shut every instance down in reverse declaration order and enter
    /// `Stopped`.  Failures become `ShutdownError` diagnostics.  Idempotent.
    pub fn stop(&mut self) {
        if self.state == SchedulerState::Stopped {
            return;
        }
        for instance in self.instances.iter_mut().rev() {
            if let Err(e) = instance.shutdown(self.bus.as_ref()) {
                error!(device = %instance.name(), error = %e, "device shutdown failed");
                self.diagnostics
                    .push(Diagnostic::from_error(instance.name().to_string(), &e, None));
            }
        }
        self.state = SchedulerState::Stopped;
        info!(step = self.step, "session stopped");
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Last engine step reached.
    pub fn step_index(&self) -> u64 {
        self.step
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn instances(&self) -> &[PluginInstance] {
        &self.instances
    }

    pub fn instance(&self, name: &str) -> Option<&PluginInstance> {
        self.instances.iter().find(|i| i.name() == name)
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn summaries(&self) -> Vec<InstanceSummary> {
        self.instances.iter().map(PluginInstance::summary).collect()
    }
}

impl<E: SimulationEngine> Drop for StepScheduler<E> {
    fn drop(&mut self) {
        if self.state == SchedulerState::Running {
            self.stop();
        }
    }
}
