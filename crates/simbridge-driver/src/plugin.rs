//! Generic `DevicePlugin` trait – the capability contract every device
//! handler implements.
//!
//! Plugins are built by a [`PluginFactory`] registered under a device-type
//! tag in the [`PluginRegistry`][crate::registry::PluginRegistry].  The rest
//! of the bridge only ever talks to the trait, so compiled-in and
//! dynamically loaded handlers are driven the same way.
//!
//! # Lifecycle
//!
//! 1. [`DevicePlugin::init`] – exactly once, before any step.  Typically
//!    creates the bus publisher.
//! 2. [`DevicePlugin::on_step`] – only on steps where the instance's publish
//!    period has elapsed.  Reads the device and publishes at most one
//!    message.
//! 3. [`DevicePlugin::shutdown`] – exactly once at session end (or right
//!    after a failed `init`).  Releases bus resources.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use simbridge_hal::{DeviceHandle, SimulationEngine};
use simbridge_middleware::{MessageBus, PublisherHandle};
use simbridge_types::{BridgeError, DeviceDeclaration, Header};

/// Builds a plugin for one device.  Factories are immutable after
/// registration and may be called any number of times.
pub type PluginFactory =
    Arc<dyn Fn(&DeviceHandle, &DeviceConfig) -> Result<Box<dyn DevicePlugin>, BridgeError> + Send + Sync>;

/// Wrap a plain function or closure as a [`PluginFactory`].
pub fn factory_fn<F>(f: F) -> PluginFactory
where
    F: Fn(&DeviceHandle, &DeviceConfig) -> Result<Box<dyn DevicePlugin>, BridgeError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A device handler driven by the step scheduler.
pub trait DevicePlugin {
    /// One-time setup: validate configuration, register publishers.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InitError`] (or [`BridgeError::InvalidConfig`])
    /// when the device cannot be brought up.  The resolver then calls
    /// [`shutdown`][Self::shutdown] and drops the instance.
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<(), BridgeError>;

    /// Read the device and publish at most one message.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::StepError`] on a failed read or publish.  The
    /// scheduler counts consecutive failures towards suspension.
    fn on_step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), BridgeError>;

    /// Release bus resources.  Must tolerate being called after a partial
    /// `init`.
    fn shutdown(&mut self, bus: &dyn MessageBus) -> Result<(), BridgeError>;
}

/// Everything a plugin may touch during [`DevicePlugin::init`].
pub struct InitContext<'a> {
    pub handle: &'a DeviceHandle,
    pub config: &'a DeviceConfig,
    /// Resolved handles of the declaration's composite children.
    pub children: &'a [DeviceHandle],
    pub engine: &'a dyn SimulationEngine,
    pub bus: &'a dyn MessageBus,
    pub period_steps: u32,
}

impl InitContext<'_> {
    /// First child whose engine device type is `device_type`.
    pub fn child(&self, device_type: &str) -> Option<&DeviceHandle> {
        self.children.iter().find(|c| c.device_type == device_type)
    }
}

/// Everything a plugin may touch during [`DevicePlugin::on_step`].
pub struct StepContext<'a> {
    /// Step index the engine just reached.
    pub step: u64,
    /// Length of one simulation step.
    pub dt: Duration,
    /// Total simulated time.
    pub time: Duration,
    /// Simulated time since this instance was last due
    /// (`period_steps * dt`).
    pub elapsed: Duration,
    pub handle: &'a DeviceHandle,
    pub engine: &'a mut dyn SimulationEngine,
    pub bus: &'a dyn MessageBus,
}

impl StepContext<'_> {
    /// Header stamped with the current step and simulated time.
    pub fn header(&self, frame_id: &str) -> Header {
        Header {
            step: self.step,
            stamp: self.time.as_secs_f64(),
            frame_id: frame_id.to_string(),
        }
    }
}

/// Destroy `publisher` if it was created.  Used by plugin `shutdown`s.
pub fn release_publisher(
    bus: &dyn MessageBus,
    publisher: &mut Option<PublisherHandle>,
) -> Result<(), BridgeError> {
    match publisher.take() {
        Some(p) => bus.destroy_publisher(p),
        None => Ok(()),
    }
}

/// Publisher created in `init`, or a step error naming the device.
pub fn require_publisher<'p>(
    device: &str,
    publisher: &'p Option<PublisherHandle>,
) -> Result<&'p PublisherHandle, BridgeError> {
    publisher
        .as_ref()
        .ok_or_else(|| BridgeError::step(device, "plugin was not initialised"))
}

// ────────────────────────────────────────────────────────────────────────────
// DeviceConfig
// ────────────────────────────────────────────────────────────────────────────

/// Raw per-device configuration with typed accessors.
///
/// Every parse failure is reported as [`BridgeError::InvalidConfig`] naming
/// the device and key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceConfig {
    device: String,
    values: BTreeMap<String, String>,
}

impl DeviceConfig {
    pub fn new(device: impl Into<String>, values: BTreeMap<String, String>) -> Self {
        Self {
            device: device.into(),
            values,
        }
    }

    pub fn from_declaration(decl: &DeviceDeclaration) -> Self {
        Self::new(decl.name.clone(), decl.config.clone())
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Parse `key` when present.
    pub fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, BridgeError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
                BridgeError::config(&self.device, format!("'{key}' has invalid value '{raw}'"))
            }),
        }
    }

    /// Parse `key` as a float, falling back to `default` when absent.
    pub fn f64_or(&self, key: &str, default: f64) -> Result<f64, BridgeError> {
        let value = self.parse::<f64>(key)?.unwrap_or(default);
        if !value.is_finite() {
            return Err(BridgeError::config(&self.device, format!("'{key}' must be finite")));
        }
        Ok(value)
    }

    /// `key` as a string, falling back to `default`.
    pub fn string_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    /// Topic to publish on: `topic`, or `/<device name>` with spaces replaced
    /// by underscores.
    pub fn topic(&self) -> String {
        match self.get("topic") {
            Some(topic) => topic.to_string(),
            None => format!("/{}", self.device.replace(' ', "_")),
        }
    }

    /// Header frame id: `frame_id`, or the device name.
    pub fn frame_id(&self) -> String {
        self.string_or("frame_id", &self.device)
    }

    /// Publish period in simulation steps.
    ///
    /// Read from `period` (steps) or `period_ms` (milliseconds, rounded up
    /// to whole steps of `step`).  Defaults to `1`.
    pub fn publish_period(&self, step: Duration) -> Result<u32, BridgeError> {
        let steps = self.parse::<i64>("period")?;
        let millis = self.parse::<i64>("period_ms")?;
        let period = match (steps, millis) {
            (Some(_), Some(_)) => {
                return Err(BridgeError::config(
                    &self.device,
                    "'period' and 'period_ms' are mutually exclusive",
                ));
            }
            (Some(steps), None) => steps,
            (None, Some(ms)) => {
                let step_ms = step.as_millis();
                if step_ms == 0 {
                    return Err(BridgeError::config(
                        &self.device,
                        "'period_ms' needs a basic time step of at least 1 ms",
                    ));
                }
                if ms <= 0 {
                    ms
                } else {
                    i64::try_from((ms as u128).div_ceil(step_ms)).unwrap_or(i64::MAX)
                }
            }
            (None, None) => 1,
        };
        if period < 1 {
            return Err(BridgeError::config(
                &self.device,
                format!("publish period must be at least 1 step, got {period}"),
            ));
        }
        u32::try_from(period).map_err(|_| {
            BridgeError::config(&self.device, format!("publish period {period} is too large"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> DeviceConfig {
        let values = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DeviceConfig::new("left wheel sensor", values)
    }

    const STEP: Duration = Duration::from_millis(32);

    #[test]
    fn period_defaults_to_every_step() {
        assert_eq!(config(&[]).publish_period(STEP).unwrap(), 1);
    }

    #[test]
    fn period_in_steps() {
        assert_eq!(config(&[("period", "5")]).publish_period(STEP).unwrap(), 5);
    }

    #[test]
    fn period_ms_rounds_up_to_whole_steps() {
        assert_eq!(config(&[("period_ms", "100")]).publish_period(STEP).unwrap(), 4);
        assert_eq!(config(&[("period_ms", "64")]).publish_period(STEP).unwrap(), 2);
        assert_eq!(config(&[("period_ms", "1")]).publish_period(STEP).unwrap(), 1);
    }

    #[test]
    fn zero_negative_and_garbage_periods_are_invalid() {
        for bad in [
            config(&[("period", "0")]),
            config(&[("period", "-3")]),
            config(&[("period", "fast")]),
            config(&[("period_ms", "0")]),
            config(&[("period", "2"), ("period_ms", "64")]),
        ] {
            let err = bad.publish_period(STEP).unwrap_err();
            assert!(matches!(err, BridgeError::InvalidConfig { .. }), "{err}");
        }
    }

    #[test]
    fn default_topic_and_frame_come_from_name() {
        let cfg = config(&[]);
        assert_eq!(cfg.topic(), "/left_wheel_sensor");
        assert_eq!(cfg.frame_id(), "left wheel sensor");

        let cfg = config(&[("topic", "/odom"), ("frame_id", "base_link")]);
        assert_eq!(cfg.topic(), "/odom");
        assert_eq!(cfg.frame_id(), "base_link");
    }

    #[test]
    fn typed_accessors_report_key() {
        let cfg = config(&[("wheel_radius", "0.02"), ("gain", "lots")]);
        assert!((cfg.f64_or("wheel_radius", 1.0).unwrap() - 0.02).abs() < f64::EPSILON);
        assert!((cfg.f64_or("missing", 1.5).unwrap() - 1.5).abs() < f64::EPSILON);
        let err = cfg.f64_or("gain", 1.0).unwrap_err();
        assert!(err.to_string().contains("gain"));
        assert!(cfg.f64_or("nan", 1.0).is_ok());
        assert!(config(&[("x", "NaN")]).f64_or("x", 0.0).is_err());
    }
}
