//! `simbridge-driver` – device plugin registry and step-synchronised publish
//! scheduler.
//!
//! # Data flow
//!
//! ```text
//! Descriptor ─▶ DescriptorResolver ─▶ (DeviceHandle, PluginFactory)
//!            ─▶ PluginInstance set ─▶ StepScheduler ticks
//!            ─▶ due instances read their device ─▶ MessageBus
//! ```
//!
//! # Modules
//!
//! - [`plugin`] – the [`DevicePlugin`] contract, its init/step contexts, and
//!   [`DeviceConfig`] with typed accessors.
//! - [`registry`] – [`PluginRegistry`]: device-type tag → factory, static or
//!   dynamically loaded, with per-session failure caching.
//! - [`loader`] – [`PluginLoader`] and [`ManifestLoader`], which opens
//!   plugin shared libraries named in a TOML manifest.
//! - [`resolver`] – [`DescriptorResolver`]: declarations → initialised
//!   [`PluginInstance`]s plus one [`Diagnostic`][simbridge_types::Diagnostic]
//!   per skipped declaration.
//! - [`instance`] – [`PluginInstance`] and its per-device bookkeeping.
//! - [`scheduler`] – [`StepScheduler`]: advances the engine and drives due
//!   instances with failure isolation.
//! - [`plugins`] – the built-in `range`, `image`, `imu`, `led` and
//!   `diff_drive` plugins.

pub mod instance;
pub mod loader;
pub mod plugin;
pub mod plugins;
pub mod registry;
pub mod resolver;
pub mod scheduler;

#[cfg(test)]
mod test_support;

pub use instance::{InstanceStatus, InstanceSummary, PluginInstance};
pub use loader::{ManifestEntry, ManifestLoader, PluginLoader, PluginManifest};
pub use plugin::{DeviceConfig, DevicePlugin, InitContext, PluginFactory, StepContext, factory_fn};
pub use plugins::register_builtins;
pub use registry::{FactoryOrigin, PluginRegistry, RegistryEntry};
pub use resolver::{DescriptorResolver, Resolution};
pub use scheduler::{SchedulerConfig, SchedulerState, StepScheduler, StopHandle, TickReport};
