//! Node configuration – reads `simbridge.toml`.
//!
//! ```toml
//! step_ms = 32
//! max_steps = 0          # 0 runs until the engine ends or Ctrl-C
//! realtime = false
//!
//! [scheduler]
//! failure_threshold = 10
//!
//! [plugins]
//! manifest = "plugins.toml"
//! search_dirs = ["target/release"]
//!
//! [robot]
//! name = "e-puck"
//! [[robot.devices]]
//! type = "range"
//! name = "ps0"
//! config = { period = 2 }
//!
//! [[world.devices]]
//! type = "range"
//! name = "ps0"
//! value = 0.05
//! ```

use serde::{Deserialize, Serialize};
use simbridge_driver::SchedulerConfig;
use simbridge_types::Descriptor;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::world::WorldConfig;

/// Full node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Basic simulation time step in milliseconds.
    #[serde(default = "default_step_ms")]
    pub step_ms: u64,

    /// Stop after this many steps; `0` means no limit.
    #[serde(default)]
    pub max_steps: u64,

    /// Sleep between ticks so simulated time tracks wall-clock time.
    #[serde(default)]
    pub realtime: bool,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub plugins: PluginsConfig,

    #[serde(default)]
    pub robot: Descriptor,

    #[serde(default)]
    pub world: WorldConfig,
}

/// `[plugins]` table: where dynamically loaded plugins come from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// TOML manifest mapping device-type tags to shared libraries.
    #[serde(default)]
    pub manifest: Option<PathBuf>,

    /// Directories searched for plugin libraries, in order.
    #[serde(default)]
    pub search_dirs: Vec<PathBuf>,
}

fn default_step_ms() -> u64 {
    32
}

impl Default for Config {
    fn default() -> Self {
        Self {
            step_ms: default_step_ms(),
            max_steps: 0,
            realtime: false,
            scheduler: SchedulerConfig::default(),
            plugins: PluginsConfig::default(),
            robot: Descriptor::default(),
            world: WorldConfig::default(),
        }
    }
}

impl Config {
    pub fn time_step(&self) -> Duration {
        Duration::from_millis(self.step_ms)
    }

    /// Step limit for the run loop, `None` when unlimited.
    pub fn step_limit(&self) -> Option<u64> {
        (self.max_steps > 0).then_some(self.max_steps)
    }

    /// Reject values the node cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.step_ms == 0 {
            return Err("step_ms must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Load the config from `path`.  Returns `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg = parse(&raw, path)?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Parse `raw` as the config file found at `path`, without env overrides.
pub(crate) fn parse(raw: &str, path: &Path) -> Result<Config, String> {
    let mut cfg: Config = toml::from_str(raw)
        .map_err(|e| format!("Failed to parse config at {}: {}", path.display(), e))?;
    resolve_relative_paths(&mut cfg, path);
    Ok(cfg)
}

/// Make `[plugins]` paths relative to the config file's directory.
fn resolve_relative_paths(cfg: &mut Config, config_path: &Path) {
    let Some(base) = config_path.parent() else {
        return;
    };
    if let Some(manifest) = cfg.plugins.manifest.as_mut()
        && manifest.is_relative()
    {
        *manifest = base.join(&*manifest);
    }
    for dir in &mut cfg.plugins.search_dirs {
        if dir.is_relative() {
            *dir = base.join(&*dir);
        }
    }
}

/// Apply `SIMBRIDGE_*` environment variable overrides to `cfg`.
///
/// Supported variables:
///
/// | Variable | Config field |
/// |---|---|
/// | `SIMBRIDGE_STEP_MS` | `step_ms` |
/// | `SIMBRIDGE_MAX_STEPS` | `max_steps` |
/// | `SIMBRIDGE_FAILURE_THRESHOLD` | `scheduler.failure_threshold` |
/// | `SIMBRIDGE_PLUGIN_MANIFEST` | `plugins.manifest` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("SIMBRIDGE_STEP_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.step_ms = ms;
    }
    if let Ok(v) = std::env::var("SIMBRIDGE_MAX_STEPS")
        && let Ok(steps) = v.parse::<u64>()
    {
        cfg.max_steps = steps;
    }
    if let Ok(v) = std::env::var("SIMBRIDGE_FAILURE_THRESHOLD")
        && let Ok(threshold) = v.parse::<u32>()
    {
        cfg.scheduler.failure_threshold = threshold;
    }
    if let Ok(v) = std::env::var("SIMBRIDGE_PLUGIN_MANIFEST") {
        cfg.plugins.manifest = Some(PathBuf::from(v));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
step_ms = 16
max_steps = 100

[scheduler]
failure_threshold = 3

[plugins]
manifest = "plugins.toml"
search_dirs = ["lib", "/opt/simbridge"]

[robot]
name = "e-puck"

[[robot.devices]]
type = "range"
name = "ps0"
config = { period = 2, topic = "/ps0" }

[[robot.devices]]
type = "imu"
name = "inertial unit"

[[robot.devices.children]]
type = "gyro"
name = "gyro"

[[world.devices]]
type = "range"
name = "ps0"
value = 0.05
"#;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("simbridge.toml");
        std::fs::write(&path, contents).expect("write config");
        (dir, path)
    }

    #[test]
    fn parses_full_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let cfg = parse(SAMPLE, &dir.path().join("simbridge.toml")).expect("parse ok");

        assert_eq!(cfg.step_ms, 16);
        assert_eq!(cfg.step_limit(), Some(100));
        assert!(!cfg.realtime);
        assert_eq!(cfg.scheduler.failure_threshold, 3);

        assert_eq!(cfg.robot.name, "e-puck");
        assert_eq!(cfg.robot.devices.len(), 2);
        assert_eq!(cfg.robot.devices[0].config_value("period"), Some("2"));
        assert_eq!(cfg.robot.devices[0].config_value("topic"), Some("/ps0"));
        assert_eq!(cfg.robot.devices[1].children[0].device_type, "gyro");

        assert_eq!(cfg.world.devices.len(), 1);
        assert_eq!(cfg.world.devices[0].value, Some(0.05));

        assert_eq!(
            cfg.plugins.manifest.as_deref(),
            Some(dir.path().join("plugins.toml").as_path())
        );
        assert_eq!(cfg.plugins.search_dirs[0], dir.path().join("lib"));
        assert_eq!(cfg.plugins.search_dirs[1], PathBuf::from("/opt/simbridge"));
    }

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = parse("", Path::new("simbridge.toml")).expect("parse ok");
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.time_step(), Duration::from_millis(32));
        assert_eq!(cfg.step_limit(), None);
        assert_eq!(cfg.scheduler.failure_threshold, 10);
    }

    #[test]
    fn load_from_reads_file() {
        let (_dir, path) = write_config(SAMPLE);
        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.robot.devices[0].name, "ps0");
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let result = load_from(&dir.path().join("absent.toml")).expect("no error");
        assert!(result.is_none());
    }

    #[test]
    fn load_from_reports_parse_errors() {
        let (_dir, path) = write_config("step_ms = \"fast\"");
        let err = load_from(&path).unwrap_err();
        assert!(err.starts_with("Failed to parse config"));
    }

    #[test]
    fn validate_rejects_zero_step() {
        let cfg = Config {
            step_ms: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn apply_env_overrides_changes_step_ms() {
        // SAFETY: single-threaded test; no other test reads this env-var.
        unsafe { std::env::set_var("SIMBRIDGE_STEP_MS", "8") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.step_ms, 8);
        unsafe { std::env::remove_var("SIMBRIDGE_STEP_MS") };
    }

    #[test]
    fn apply_env_overrides_changes_failure_threshold() {
        // SAFETY: single-threaded test; no other test reads this env-var.
        unsafe { std::env::set_var("SIMBRIDGE_FAILURE_THRESHOLD", "4") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.scheduler.failure_threshold, 4);
        unsafe { std::env::remove_var("SIMBRIDGE_FAILURE_THRESHOLD") };
    }

    #[test]
    fn apply_env_overrides_changes_manifest() {
        // SAFETY: single-threaded test; no other test reads this env-var.
        unsafe { std::env::set_var("SIMBRIDGE_PLUGIN_MANIFEST", "/etc/simbridge/plugins.toml") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(
            cfg.plugins.manifest,
            Some(PathBuf::from("/etc/simbridge/plugins.toml"))
        );
        unsafe { std::env::remove_var("SIMBRIDGE_PLUGIN_MANIFEST") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_max_steps() {
        // SAFETY: single-threaded test; no other test reads this env-var.
        unsafe { std::env::set_var("SIMBRIDGE_MAX_STEPS", "forever") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.max_steps, 0);
        unsafe { std::env::remove_var("SIMBRIDGE_MAX_STEPS") };
    }
}
