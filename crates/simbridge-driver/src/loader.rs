//! Dynamic plugin loading.
//!
//! [`PluginLoader`] is the seam the [`PluginRegistry`][crate::registry::PluginRegistry]
//! consults for type tags with no compiled-in factory.  [`ManifestLoader`]
//! implements it over a TOML manifest and shared libraries opened with
//! `libloading`.
//!
//! # Manifest
//!
//! ```toml
//! [[plugin]]
//! type = "sonar"
//! library = "libsonar_plugin.so"          # optional
//! entry_symbol = "simbridge_plugin_entry" # optional
//! ```
//!
//! Without `library`, the file name is derived from the tag with
//! [`libloading::library_filename`] (`libsimbridge_sonar.so` on Linux,
//! `simbridge_sonar.dll` on Windows).  Relative names are searched for in
//! every search directory, in order.
//!
//! # ABI
//!
//! The entry symbol is an `extern "C" fn() -> *const PluginVTable`.  Configs
//! and device readings cross the boundary as JSON; `step` returns a JSON
//! [`Message`], `{"error": "..."}`, or null when there is nothing to publish.
//! Every string the plugin returns is handed back through `free_string`.
//! The header of a returned message is replaced with the engine's step,
//! simulation time and the device's frame id before it is published.

use std::ffi::{CStr, CString, c_char, c_void};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::{Library, Symbol};
use serde::{Deserialize, Serialize};
use simbridge_hal::DeviceHandle;
use simbridge_middleware::{MessageBus, PublisherHandle};
use simbridge_types::{BridgeError, Message, MessageSchema};
use tracing::{debug, info};

use crate::plugin::{
    DeviceConfig, DevicePlugin, InitContext, PluginFactory, StepContext, factory_fn,
    release_publisher, require_publisher,
};

/// Version of [`PluginVTable`] this host understands.
pub const PLUGIN_ABI_VERSION: u32 = 1;

/// Entry symbol used when the manifest does not name one.
pub const DEFAULT_ENTRY_SYMBOL: &str = "simbridge_plugin_entry";

/// Produces factories for type tags that have no compiled-in plugin.
pub trait PluginLoader {
    /// Load the plugin registered for `type_tag`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::LoadError`] when no plugin is known for the tag
    /// or it cannot be loaded.
    fn load_by_name(&self, type_tag: &str) -> Result<PluginFactory, BridgeError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Manifest
// ────────────────────────────────────────────────────────────────────────────

/// Parsed plugin manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    #[serde(default, rename = "plugin")]
    pub plugins: Vec<ManifestEntry>,
}

/// One `[[plugin]]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(default)]
    pub library: Option<PathBuf>,
    #[serde(default)]
    pub entry_symbol: Option<String>,
}

impl PluginManifest {
    pub fn entry(&self, type_tag: &str) -> Option<&ManifestEntry> {
        self.plugins.iter().find(|p| p.type_tag == type_tag)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ABI
// ────────────────────────────────────────────────────────────────────────────

/// Function table exported by a dynamic plugin.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PluginVTable {
    pub abi_version: u32,
    /// Payload schema code, see [`schema_from_code`].
    pub schema: u32,
    /// Create one instance from a JSON config.  Null on failure.
    pub create: unsafe extern "C" fn(config_json: *const c_char) -> *mut c_void,
    pub step: unsafe extern "C" fn(
        instance: *mut c_void,
        step: u64,
        dt_s: f64,
        reading_json: *const c_char,
    ) -> *mut c_char,
    pub free_string: unsafe extern "C" fn(s: *mut c_char),
    pub destroy: unsafe extern "C" fn(instance: *mut c_void),
}

/// Signature of the entry symbol.
pub type PluginEntryFn = unsafe extern "C" fn() -> *const PluginVTable;

/// Map a vtable schema code to the payload schema it publishes.
pub fn schema_from_code(code: u32) -> Option<MessageSchema> {
    match code {
        0 => Some(MessageSchema::Range),
        1 => Some(MessageSchema::Image),
        2 => Some(MessageSchema::Imu),
        3 => Some(MessageSchema::Odometry),
        4 => Some(MessageSchema::LedState),
        _ => None,
    }
}

/// A loaded library and the vtable it exported.  The library stays mapped
/// for as long as any plugin built from it is alive.
struct ForeignModule {
    type_tag: String,
    vtable: PluginVTable,
    schema: MessageSchema,
    _lib: Library,
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    device: &'a str,
    device_type: &'a str,
    config: &'a std::collections::BTreeMap<String, String>,
    period_steps: u32,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StepOutput {
    Error { error: String },
    Message(Message),
}

/// [`DevicePlugin`] backed by a [`ForeignModule`] instance.
struct ForeignPlugin {
    module: Arc<ForeignModule>,
    device: String,
    topic: String,
    frame_id: String,
    instance: *mut c_void,
    publisher: Option<PublisherHandle>,
}

impl ForeignPlugin {
    fn destroy_instance(&mut self) {
        if !self.instance.is_null() {
            // SAFETY: `instance` came from this module's `create` and is
            // destroyed exactly once; the library is still loaded.
            unsafe { (self.module.vtable.destroy)(self.instance) };
            self.instance = std::ptr::null_mut();
        }
    }

    /// Copy and release a string returned by the plugin.
    fn take_string(&self, raw: *mut c_char) -> Option<String> {
        if raw.is_null() {
            return None;
        }
        // SAFETY: non-null strings returned by `step` are NUL-terminated and
        // owned by the plugin until handed back through `free_string`.
        let text = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
        // SAFETY: `raw` was returned by this module and is freed exactly once.
        unsafe { (self.module.vtable.free_string)(raw) };
        Some(text)
    }
}

impl DevicePlugin for ForeignPlugin {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<(), BridgeError> {
        let request = CreateRequest {
            device: &ctx.handle.name,
            device_type: &ctx.handle.device_type,
            config: ctx.config.values(),
            period_steps: ctx.period_steps,
        };
        let json = serde_json::to_string(&request).map_err(|e| BridgeError::InitError {
            device: self.device.clone(),
            details: e.to_string(),
        })?;
        let json = CString::new(json).map_err(|e| BridgeError::InitError {
            device: self.device.clone(),
            details: e.to_string(),
        })?;

        // SAFETY: `create` follows the vtable contract; `json` outlives the call.
        let instance = unsafe { (self.module.vtable.create)(json.as_ptr()) };
        if instance.is_null() {
            return Err(BridgeError::InitError {
                device: self.device.clone(),
                details: format!("plugin '{}' refused the configuration", self.module.type_tag),
            });
        }
        self.instance = instance;

        self.publisher = Some(
            ctx.bus
                .create_publisher(&self.topic, self.module.schema)
                .map_err(|e| BridgeError::InitError {
                    device: self.device.clone(),
                    details: e.to_string(),
                })?,
        );
        Ok(())
    }

    fn on_step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), BridgeError> {
        if self.instance.is_null() {
            return Err(BridgeError::step(&self.device, "plugin instance was not created"));
        }
        let reading = ctx.engine.read(ctx.handle)?;
        let json = serde_json::to_string(&reading)
            .map_err(|e| BridgeError::step(&self.device, e.to_string()))?;
        let json = CString::new(json).map_err(|e| BridgeError::step(&self.device, e.to_string()))?;

        // SAFETY: `instance` is live; `json` outlives the call.
        let raw = unsafe {
            (self.module.vtable.step)(self.instance, ctx.step, ctx.dt.as_secs_f64(), json.as_ptr())
        };
        let Some(text) = self.take_string(raw) else {
            return Ok(());
        };

        let output: StepOutput = serde_json::from_str(&text).map_err(|e| {
            BridgeError::step(&self.device, format!("plugin returned malformed output: {e}"))
        })?;
        match output {
            StepOutput::Error { error } => Err(BridgeError::step(&self.device, error)),
            StepOutput::Message(mut message) => {
                // Step, stamp and frame always come from the engine.
                if let Some(header) = message.header_mut() {
                    *header = ctx.header(&self.frame_id);
                }
                let publisher = require_publisher(&self.device, &self.publisher)?;
                ctx.bus
                    .publish(publisher, message)
                    .map_err(|e| BridgeError::step(&self.device, e.to_string()))?;
                Ok(())
            }
        }
    }

    fn shutdown(&mut self, bus: &dyn MessageBus) -> Result<(), BridgeError> {
        self.destroy_instance();
        release_publisher(bus, &mut self.publisher)
    }
}

impl Drop for ForeignPlugin {
    fn drop(&mut self) {
        self.destroy_instance();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ManifestLoader
// ────────────────────────────────────────────────────────────────────────────

/// [`PluginLoader`] over a [`PluginManifest`] and a list of search
/// directories.
#[derive(Debug, Clone, Default)]
pub struct ManifestLoader {
    manifest: PluginManifest,
    search_dirs: Vec<PathBuf>,
}

impl ManifestLoader {
    pub fn new(manifest: PluginManifest, search_dirs: Vec<PathBuf>) -> Self {
        Self {
            manifest,
            search_dirs,
        }
    }

    /// Read the manifest from a TOML file.
    ///
    /// Relative library paths are searched for in `search_dirs` and then in
    /// the manifest's own directory.
    pub fn from_file(path: &Path, mut search_dirs: Vec<PathBuf>) -> Result<Self, BridgeError> {
        let invalid = |details: String| BridgeError::config(path.display().to_string(), details);
        let text = std::fs::read_to_string(path)
            .map_err(|e| invalid(format!("cannot read plugin manifest: {e}")))?;
        let manifest: PluginManifest = toml::from_str(&text)
            .map_err(|e| invalid(format!("cannot parse plugin manifest: {e}")))?;
        if let Some(dir) = path.parent()
            && !search_dirs.iter().any(|d| d == dir)
        {
            search_dirs.push(dir.to_path_buf());
        }
        info!(path = %path.display(), plugins = manifest.plugins.len(), "plugin manifest loaded");
        Ok(Self::new(manifest, search_dirs))
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    /// Paths tried, in order, for `entry`.
    pub fn library_candidates(&self, entry: &ManifestEntry) -> Vec<PathBuf> {
        let file: PathBuf = match &entry.library {
            Some(library) => library.clone(),
            None => PathBuf::from(libloading::library_filename(format!(
                "simbridge_{}",
                entry.type_tag
            ))),
        };
        if file.is_absolute() || self.search_dirs.is_empty() {
            return vec![file];
        }
        self.search_dirs.iter().map(|dir| dir.join(&file)).collect()
    }

    fn open(&self, entry: &ManifestEntry, path: &Path) -> Result<ForeignModule, BridgeError> {
        let type_tag = entry.type_tag.as_str();
        let fail = |details: String| BridgeError::LoadError {
            type_tag: type_tag.to_string(),
            details,
        };

        // SAFETY: loading a plugin library runs its initialisers; the
        // manifest is trusted configuration.
        let lib = unsafe { Library::new(path) }
            .map_err(|e| fail(format!("failed to load {}: {e}", path.display())))?;

        let symbol = entry.entry_symbol.as_deref().unwrap_or(DEFAULT_ENTRY_SYMBOL);
        // SAFETY: the symbol type is the documented entry signature.
        let vtable_ptr = unsafe {
            let entry_fn: Symbol<PluginEntryFn> = lib
                .get(symbol.as_bytes())
                .map_err(|e| fail(format!("missing entry symbol `{symbol}` in {}: {e}", path.display())))?;
            entry_fn()
        };
        if vtable_ptr.is_null() {
            return Err(fail(format!("entry symbol `{symbol}` returned a null vtable")));
        }
        // SAFETY: non-null vtable pointers stay valid while the library is
        // loaded; the table is copied out by value.
        let vtable = unsafe { *vtable_ptr };
        if vtable.abi_version != PLUGIN_ABI_VERSION {
            return Err(fail(format!(
                "abi_version mismatch: plugin={}, host={PLUGIN_ABI_VERSION}",
                vtable.abi_version
            )));
        }
        let schema = schema_from_code(vtable.schema)
            .ok_or_else(|| fail(format!("unknown schema code {}", vtable.schema)))?;

        Ok(ForeignModule {
            type_tag: type_tag.to_string(),
            vtable,
            schema,
            _lib: lib,
        })
    }
}

impl PluginLoader for ManifestLoader {
    fn load_by_name(&self, type_tag: &str) -> Result<PluginFactory, BridgeError> {
        let entry = self.manifest.entry(type_tag).ok_or_else(|| BridgeError::LoadError {
            type_tag: type_tag.to_string(),
            details: "no plugin manifest entry".to_string(),
        })?;

        let candidates = self.library_candidates(entry);
        let path = candidates
            .iter()
            .find(|p| p.is_file())
            .ok_or_else(|| BridgeError::LoadError {
                type_tag: type_tag.to_string(),
                details: format!(
                    "library not found (tried {})",
                    candidates
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            })?;

        let module = Arc::new(self.open(entry, path)?);
        debug!(type_tag, path = %path.display(), "plugin library opened");
        Ok(foreign_factory(module))
    }
}

/// Factory building one [`ForeignPlugin`] per device from `module`.
fn foreign_factory(module: Arc<ForeignModule>) -> PluginFactory {
    factory_fn(move |handle: &DeviceHandle, config: &DeviceConfig| {
        Ok(Box::new(ForeignPlugin {
            module: module.clone(),
            device: handle.name.clone(),
            topic: config.topic(),
            frame_id: config.frame_id(),
            instance: std::ptr::null_mut(),
            publisher: None,
        }) as Box<dyn DevicePlugin>)
    })
}

impl fmt::Debug for ForeignModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignModule")
            .field("type_tag", &self.type_tag)
            .field("abi_version", &self.vtable.abi_version)
            .field("schema", &self.schema)
            .finish()
    }
}
