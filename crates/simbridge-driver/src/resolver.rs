//! [`DescriptorResolver`] – turns device declarations into initialised
//! [`PluginInstance`]s.
//!
//! Resolution is per declaration and never aborts: every declaration either
//! becomes an instance or yields exactly one [`Diagnostic`].  Checks run in
//! this order, and the first failure wins:
//!
//! | # | Check | Failure |
//! |---|---|---|
//! | 1 | name not claimed by an earlier declaration | `DuplicateDeviceName` |
//! | 2 | type tag has a static or loadable factory | `UnknownDeviceType` |
//! | 3 | engine has a device of that name and type (children too) | `DeviceNotFound` |
//! | 4 | publish period parses to ≥ 1 step | `InvalidConfig` |
//! | 5 | factory and `init` succeed | `InitError` / `InvalidConfig` |
//!
//! A declaration whose `init` fails is shut down before it is dropped.

use std::collections::HashSet;

use simbridge_hal::{DeviceHandle, SimulationEngine};
use simbridge_middleware::MessageBus;
use simbridge_types::{BridgeError, DeviceDeclaration, Diagnostic, ErrorKind};
use tracing::{info, instrument, warn};

use crate::instance::{PluginInstance, catch_plugin_panic, shutdown_plugin};
use crate::plugin::{DeviceConfig, InitContext};
use crate::registry::{FactoryOrigin, PluginRegistry};

/// Outcome of resolving one descriptor.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Initialised instances, in declaration order.
    pub instances: Vec<PluginInstance>,
    /// One entry per skipped declaration, in declaration order.
    pub diagnostics: Vec<Diagnostic>,
}

impl Resolution {
    pub fn resolved_names(&self) -> Vec<&str> {
        self.instances.iter().map(PluginInstance::name).collect()
    }

    /// `(device, kind)` of every skipped declaration.
    pub fn skipped(&self) -> Vec<(&str, ErrorKind)> {
        self.diagnostics
            .iter()
            .map(|d| (d.device.as_str(), d.kind))
            .collect()
    }
}

/// Matches declarations to registry factories and engine devices.
pub struct DescriptorResolver<'a> {
    engine: &'a dyn SimulationEngine,
    bus: &'a dyn MessageBus,
    registry: &'a mut PluginRegistry,
}

impl<'a> DescriptorResolver<'a> {
    pub fn new(
        engine: &'a dyn SimulationEngine,
        bus: &'a dyn MessageBus,
        registry: &'a mut PluginRegistry,
    ) -> Self {
        Self {
            engine,
            bus,
            registry,
        }
    }

    /// Resolve `declarations` in order.
    #[instrument(level = "debug", skip_all, fields(declarations = declarations.len()))]
    pub fn resolve(&mut self, declarations: &[DeviceDeclaration]) -> Resolution {
        let mut resolution = Resolution::default();
        let mut claimed: HashSet<&str> = HashSet::new();

        for decl in declarations {
            let outcome = if claimed.insert(decl.name.as_str()) {
                self.resolve_one(decl)
            } else {
                Err(BridgeError::DuplicateDeviceName(decl.name.clone()))
            };

            match outcome {
                Ok(instance) => {
                    info!(
                        device = %instance.name(),
                        type_tag = %instance.type_tag(),
                        period_steps = instance.period_steps(),
                        "device resolved"
                    );
                    resolution.instances.push(instance);
                }
                Err(e) => {
                    warn!(device = %decl.name, kind = %e.kind(), error = %e, "device skipped");
                    resolution
                        .diagnostics
                        .push(Diagnostic::from_error(decl.name.clone(), &e, None));
                }
            }
        }

        info!(
            resolved = resolution.instances.len(),
            skipped = resolution.diagnostics.len(),
            "descriptor resolved"
        );
        resolution
    }

    fn resolve_one(&mut self, decl: &DeviceDeclaration) -> Result<PluginInstance, BridgeError> {
        if decl.name.trim().is_empty() {
            return Err(BridgeError::config(&decl.name, "device name is empty"));
        }

        let factory = self
            .registry
            .resolve_dynamic(&decl.device_type)
            .map_err(|e| BridgeError::UnknownDeviceType {
                device: decl.name.clone(),
                type_tag: decl.device_type.clone(),
                details: match e {
                    BridgeError::LoadError { details, .. } => details,
                    other => other.to_string(),
                },
            })?;
        let origin = self
            .registry
            .origin(&decl.device_type)
            .unwrap_or(FactoryOrigin::Static);

        let handle = self.lookup(&decl.name, &decl.device_type, &decl.name)?;
        let children = decl
            .children
            .iter()
            .map(|child| self.lookup(&decl.name, &child.device_type, &child.name))
            .collect::<Result<Vec<_>, _>>()?;

        let config = DeviceConfig::from_declaration(decl);
        let period_steps = config.publish_period(self.engine.basic_time_step())?;

        let mut plugin = match catch_plugin_panic(|| factory(&handle, &config)) {
            Ok(Ok(plugin)) => plugin,
            Ok(Err(e @ BridgeError::InvalidConfig { .. })) => return Err(e),
            Ok(Err(e)) => return Err(init_error(&decl.name, e.to_string())),
            Err(panic) => return Err(init_error(&decl.name, format!("factory panicked: {panic}"))),
        };

        let ctx = InitContext {
            handle: &handle,
            config: &config,
            children: &children,
            engine: self.engine,
            bus: self.bus,
            period_steps,
        };
        let init = match catch_plugin_panic(|| plugin.init(&ctx)) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e @ (BridgeError::InitError { .. } | BridgeError::InvalidConfig { .. }))) => Err(e),
            Ok(Err(e)) => Err(init_error(&decl.name, e.to_string())),
            Err(panic) => Err(init_error(&decl.name, format!("init panicked: {panic}"))),
        };
        if let Err(e) = init {
            if let Err(shutdown) = shutdown_plugin(&decl.name, plugin.as_mut(), self.bus) {
                warn!(device = %decl.name, error = %shutdown, "shutdown after failed init also failed");
            }
            return Err(e);
        }

        Ok(PluginInstance::new(
            handle,
            children,
            decl.device_type.clone(),
            origin,
            period_steps,
            plugin,
        ))
    }

    /// Engine device `name`, which must have type `device_type`.  Failures
    /// are attributed to `owner`.
    fn lookup(&self, owner: &str, device_type: &str, name: &str) -> Result<DeviceHandle, BridgeError> {
        let not_found = |details: String| BridgeError::DeviceNotFound {
            device: owner.to_string(),
            details,
        };
        let handle = self.engine.device(name).ok_or_else(|| {
            if owner == name {
                not_found("no such device in the simulation".to_string())
            } else {
                not_found(format!("child device '{name}' not found in the simulation"))
            }
        })?;
        if handle.device_type != device_type {
            return Err(not_found(format!(
                "simulation device '{name}' is a '{}', declared as '{device_type}'",
                handle.device_type
            )));
        }
        Ok(handle)
    }
}

fn init_error(device: &str, details: String) -> BridgeError {
    BridgeError::InitError {
        device: device.to_string(),
        details,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Behaviour, Event, Journal, scripted_factory};
    use simbridge_hal::{SimEngine, device_types};
    use simbridge_middleware::EventBus;

    fn registry(journal: &Journal, overrides: &[(&str, Behaviour)]) -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        for tag in [device_types::RANGE, device_types::IMAGE, device_types::IMU] {
            registry
                .register_static(tag, scripted_factory(journal, overrides))
                .unwrap();
        }
        registry
    }

    fn engine() -> SimEngine {
        SimEngine::builder()
            .with_range("front_lidar", 0.5)
            .with_range("ps0", 0.1)
            .with_camera("cam0", 4, 4)
            .with_inertial_unit("imu")
            .with_gyro("gyro")
            .build()
    }

    fn declarations() -> Vec<DeviceDeclaration> {
        vec![
            DeviceDeclaration::new("range", "front_lidar"),
            DeviceDeclaration::new("image", "cam0").with_config("period", 5),
            DeviceDeclaration::new("unknown", "bad"),
        ]
    }

    #[test]
    fn scenario_resolves_two_and_reports_unknown_type() {
        let journal = Journal::default();
        let mut registry = registry(&journal, &[]);
        let engine = engine();
        let bus = EventBus::default();

        let resolution = DescriptorResolver::new(&engine, &bus, &mut registry).resolve(&declarations());

        assert_eq!(resolution.resolved_names(), vec!["front_lidar", "cam0"]);
        assert_eq!(resolution.skipped(), vec![("bad", ErrorKind::UnknownDeviceType)]);
        assert_eq!(resolution.instances[1].period_steps(), 5);
        assert_eq!(journal.inits(), vec!["front_lidar".to_string(), "cam0".to_string()]);
    }

    #[test]
    fn resolution_is_idempotent() {
        let journal = Journal::default();
        let mut registry = registry(&journal, &[]);
        let engine = engine();
        let bus = EventBus::default();
        let mut decls = declarations();
        decls.push(DeviceDeclaration::new("range", "ghost"));
        decls.push(DeviceDeclaration::new("range", "ps0").with_config("period", 0));

        let first = DescriptorResolver::new(&engine, &bus, &mut registry).resolve(&decls);
        let second = DescriptorResolver::new(&engine, &bus, &mut registry).resolve(&decls);

        assert_eq!(first.resolved_names(), second.resolved_names());
        assert_eq!(first.skipped(), second.skipped());
        assert_eq!(
            first.skipped(),
            vec![
                ("bad", ErrorKind::UnknownDeviceType),
                ("ghost", ErrorKind::DeviceNotFound),
                ("ps0", ErrorKind::InvalidConfig),
            ]
        );
    }

    #[test]
    fn duplicate_names_are_skipped_even_after_failed_first() {
        let journal = Journal::default();
        let mut registry = registry(&journal, &[]);
        let engine = engine();
        let bus = EventBus::default();
        let decls = vec![
            DeviceDeclaration::new("range", "ps0"),
            DeviceDeclaration::new("range", "ps0"),
            DeviceDeclaration::new("sonar", "ghost"),
            DeviceDeclaration::new("range", "ghost"),
        ];

        let resolution = DescriptorResolver::new(&engine, &bus, &mut registry).resolve(&decls);
        assert_eq!(resolution.resolved_names(), vec!["ps0"]);
        assert_eq!(
            resolution.skipped(),
            vec![
                ("ps0", ErrorKind::DuplicateDeviceName),
                ("ghost", ErrorKind::UnknownDeviceType),
                ("ghost", ErrorKind::DuplicateDeviceName),
            ]
        );
    }

    #[test]
    fn engine_type_mismatch_is_device_not_found() {
        let journal = Journal::default();
        let mut registry = registry(&journal, &[]);
        let engine = engine();
        let bus = EventBus::default();
        let decls = vec![DeviceDeclaration::new("image", "ps0")];

        let resolution = DescriptorResolver::new(&engine, &bus, &mut registry).resolve(&decls);
        assert!(resolution.instances.is_empty());
        assert_eq!(resolution.diagnostics[0].kind, ErrorKind::DeviceNotFound);
        assert!(resolution.diagnostics[0].message.contains("declared as 'image'"));
    }

    #[test]
    fn children_are_resolved_and_missing_child_fails_parent() {
        let journal = Journal::default();
        let mut registry = registry(&journal, &[]);
        let engine = engine();
        let bus = EventBus::default();
        let decls = vec![
            DeviceDeclaration::new("imu", "imu").with_child(DeviceDeclaration::new("gyro", "gyro")),
        ];
        let resolution = DescriptorResolver::new(&engine, &bus, &mut registry).resolve(&decls);
        assert_eq!(resolution.instances[0].children().len(), 1);
        assert_eq!(resolution.instances[0].children()[0].name, "gyro");

        let decls = vec![
            DeviceDeclaration::new("imu", "imu")
                .with_child(DeviceDeclaration::new("accelerometer", "accelerometer")),
        ];
        let resolution = DescriptorResolver::new(&engine, &bus, &mut registry).resolve(&decls);
        assert!(resolution.instances.is_empty());
        assert_eq!(resolution.diagnostics[0].kind, ErrorKind::DeviceNotFound);
        assert_eq!(resolution.diagnostics[0].device, "imu");
    }

    #[test]
    fn failed_init_is_shut_down_and_skipped() {
        let journal = Journal::default();
        let mut registry = registry(&journal, &[("ps0", Behaviour::FailInit)]);
        let engine = engine();
        let bus = EventBus::default();
        let decls = vec![
            DeviceDeclaration::new("range", "ps0"),
            DeviceDeclaration::new("range", "front_lidar"),
        ];

        let resolution = DescriptorResolver::new(&engine, &bus, &mut registry).resolve(&decls);
        assert_eq!(resolution.resolved_names(), vec!["front_lidar"]);
        assert_eq!(resolution.skipped(), vec![("ps0", ErrorKind::InitError)]);
        assert_eq!(
            journal.events(),
            vec![
                Event::Init("ps0".to_string()),
                Event::Shutdown("ps0".to_string()),
                Event::Init("front_lidar".to_string()),
            ]
        );
    }

    #[test]
    fn period_ms_uses_engine_time_step() {
        let journal = Journal::default();
        let mut registry = registry(&journal, &[]);
        let engine = engine();
        let bus = EventBus::default();
        let decls = vec![DeviceDeclaration::new("range", "ps0").with_config("period_ms", 100)];

        let resolution = DescriptorResolver::new(&engine, &bus, &mut registry).resolve(&decls);
        assert_eq!(resolution.instances[0].period_steps(), 4);
    }

    #[test]
    fn load_failure_text_is_carried_into_unknown_type() {
        let journal = Journal::default();
        let mut registry = registry(&journal, &[]);
        let engine = engine();
        let bus = EventBus::default();
        let decls = vec![
            DeviceDeclaration::new("sonar", "s0"),
            DeviceDeclaration::new("sonar", "s1"),
        ];

        let resolution = DescriptorResolver::new(&engine, &bus, &mut registry).resolve(&decls);
        assert_eq!(
            resolution.skipped(),
            vec![("s0", ErrorKind::UnknownDeviceType), ("s1", ErrorKind::UnknownDeviceType)]
        );
        assert!(resolution.diagnostics[0].message.contains("no dynamic loader"));
        assert_eq!(registry.failed_loads().len(), 1);
    }
}
