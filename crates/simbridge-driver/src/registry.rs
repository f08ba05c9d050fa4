//! [`PluginRegistry`] – device-type tag → plugin factory.
//!
//! Static entries are compiled in and registered during process start-up,
//! before any descriptor is resolved.  Tags not found among them are handed
//! to the optional [`PluginLoader`] on first reference; the outcome, success
//! or failure, is cached for the rest of the session so a broken plugin is
//! never retried.
//!
//! The registry is only mutated while descriptors are resolved.  The
//! scheduler never sees it: instances own their plugin outright.

use std::collections::HashMap;
use std::fmt;

use simbridge_types::BridgeError;
use tracing::{info, warn};

use crate::loader::PluginLoader;
use crate::plugin::PluginFactory;

/// Where a registry entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FactoryOrigin {
    /// Compiled in and registered at start-up.
    Static,
    /// Loaded by name through the [`PluginLoader`].
    Dynamic,
}

/// One registered factory.
#[derive(Clone)]
pub struct RegistryEntry {
    pub type_tag: String,
    pub factory: PluginFactory,
    pub origin: FactoryOrigin,
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("type_tag", &self.type_tag)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Device-type tag → factory map.
///
/// Construct with [`PluginRegistry::new`], register the compiled-in factories
/// with [`register_static`][Self::register_static], optionally install a
/// loader with [`with_loader`][Self::with_loader], then hand the registry to
/// the [`DescriptorResolver`][crate::resolver::DescriptorResolver].
#[derive(Default)]
pub struct PluginRegistry {
    entries: HashMap<String, RegistryEntry>,
    failed_loads: HashMap<String, BridgeError>,
    loader: Option<Box<dyn PluginLoader>>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("entries", &self.type_tags())
            .field("failed_loads", &self.failed_loads.keys().collect::<Vec<_>>())
            .field("loader", &self.loader.is_some())
            .finish()
    }
}

impl PluginRegistry {
    /// Create an empty registry with no loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the loader used for tags with no static entry.
    pub fn with_loader(mut self, loader: Box<dyn PluginLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Register a compiled-in factory.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DuplicateTypeTag`] when `type_tag` is already
    /// registered.  The existing entry is left untouched.
    pub fn register_static(
        &mut self,
        type_tag: impl Into<String>,
        factory: PluginFactory,
    ) -> Result<(), BridgeError> {
        let type_tag = type_tag.into();
        if self.entries.contains_key(&type_tag) {
            return Err(BridgeError::DuplicateTypeTag(type_tag));
        }
        self.entries.insert(
            type_tag.clone(),
            RegistryEntry {
                type_tag,
                factory,
                origin: FactoryOrigin::Static,
            },
        );
        Ok(())
    }

    /// Factory for `type_tag`, loading it through the loader on first
    /// reference.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::LoadError`].  A tag that failed once keeps
    /// failing with the same error without consulting the loader again.
    pub fn resolve_dynamic(&mut self, type_tag: &str) -> Result<PluginFactory, BridgeError> {
        if let Some(entry) = self.entries.get(type_tag) {
            return Ok(entry.factory.clone());
        }
        if let Some(cached) = self.failed_loads.get(type_tag) {
            return Err(cached.clone());
        }

        let outcome = match &self.loader {
            Some(loader) => loader.load_by_name(type_tag).map_err(|e| match e {
                BridgeError::LoadError { .. } => e,
                other => BridgeError::LoadError {
                    type_tag: type_tag.to_string(),
                    details: other.to_string(),
                },
            }),
            None => Err(BridgeError::LoadError {
                type_tag: type_tag.to_string(),
                details: "no static plugin and no dynamic loader configured".to_string(),
            }),
        };

        match outcome {
            Ok(factory) => {
                info!(type_tag, "dynamic plugin loaded");
                self.entries.insert(
                    type_tag.to_string(),
                    RegistryEntry {
                        type_tag: type_tag.to_string(),
                        factory: factory.clone(),
                        origin: FactoryOrigin::Dynamic,
                    },
                );
                Ok(factory)
            }
            Err(e) => {
                warn!(type_tag, error = %e, "dynamic plugin load failed; not retrying this session");
                self.failed_loads.insert(type_tag.to_string(), e.clone());
                Err(e)
            }
        }
    }

    /// Static lookup first, then dynamic resolution.
    pub fn get(&mut self, type_tag: &str) -> Option<PluginFactory> {
        self.resolve_dynamic(type_tag).ok()
    }

    /// Origin of a registered (or already loaded) tag.
    pub fn origin(&self, type_tag: &str) -> Option<FactoryOrigin> {
        self.entries.get(type_tag).map(|e| e.origin)
    }

    /// Registered and loaded tags, sorted.
    pub fn type_tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Tags whose dynamic load failed, with the cached error, sorted by tag.
    pub fn failed_loads(&self) -> Vec<(&str, &BridgeError)> {
        let mut failed: Vec<(&str, &BridgeError)> =
            self.failed_loads.iter().map(|(k, v)| (k.as_str(), v)).collect();
        failed.sort_unstable_by_key(|(tag, _)| *tag);
        failed
    }
}
