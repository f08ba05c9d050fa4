//! Error type and per-device diagnostics.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of every failure the bridge can report.
///
/// Diagnostics surfaced to operators are distinguishable by kind and device
/// name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DeviceNotFound,
    UnknownDeviceType,
    DuplicateTypeTag,
    DuplicateDeviceName,
    InvalidConfig,
    InitError,
    LoadError,
    StepError,
    DeviceSuspended,
    ShutdownError,
    Engine,
    Bus,
    InvalidState,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::DeviceNotFound => "device_not_found",
            ErrorKind::UnknownDeviceType => "unknown_device_type",
            ErrorKind::DuplicateTypeTag => "duplicate_type_tag",
            ErrorKind::DuplicateDeviceName => "duplicate_device_name",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::InitError => "init_error",
            ErrorKind::LoadError => "load_error",
            ErrorKind::StepError => "step_error",
            ErrorKind::DeviceSuspended => "device_suspended",
            ErrorKind::ShutdownError => "shutdown_error",
            ErrorKind::Engine => "engine",
            ErrorKind::Bus => "bus",
            ErrorKind::InvalidState => "invalid_state",
        };
        f.write_str(s)
    }
}

/// Error type spanning descriptor resolution, plugin lifecycle, the engine
/// and the bus.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Device Not Found: {device}: {details}")]
    DeviceNotFound { device: String, details: String },

    #[error("Unknown Device Type '{type_tag}' for {device}: {details}")]
    UnknownDeviceType {
        device: String,
        type_tag: String,
        details: String,
    },

    #[error("Duplicate Type Tag: '{0}' is already registered")]
    DuplicateTypeTag(String),

    #[error("Duplicate Device Name: '{0}' is already declared")]
    DuplicateDeviceName(String),

    #[error("Invalid Config for {device}: {details}")]
    InvalidConfig { device: String, details: String },

    #[error("Init Error on {device}: {details}")]
    InitError { device: String, details: String },

    #[error("Load Error for type '{type_tag}': {details}")]
    LoadError { type_tag: String, details: String },

    #[error("Step Error on {device}: {details}")]
    StepError { device: String, details: String },

    #[error("Device Suspended: {device} after {failures} consecutive failures")]
    DeviceSuspended { device: String, failures: u32 },

    #[error("Shutdown Error on {device}: {details}")]
    ShutdownError { device: String, details: String },

    #[error("Simulation Engine Error: {0}")]
    Engine(String),

    /// The simulation reached its end; reported with kind `Engine`.
    #[error("Simulation Ended: {0}")]
    SimulationEnded(String),

    #[error("Message Bus Error: {0}")]
    Bus(String),

    #[error("Invalid State: {0}")]
    InvalidState(String),
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::DeviceNotFound { .. } => ErrorKind::DeviceNotFound,
            BridgeError::UnknownDeviceType { .. } => ErrorKind::UnknownDeviceType,
            BridgeError::DuplicateTypeTag(_) => ErrorKind::DuplicateTypeTag,
            BridgeError::DuplicateDeviceName(_) => ErrorKind::DuplicateDeviceName,
            BridgeError::InvalidConfig { .. } => ErrorKind::InvalidConfig,
            BridgeError::InitError { .. } => ErrorKind::InitError,
            BridgeError::LoadError { .. } => ErrorKind::LoadError,
            BridgeError::StepError { .. } => ErrorKind::StepError,
            BridgeError::DeviceSuspended { .. } => ErrorKind::DeviceSuspended,
            BridgeError::ShutdownError { .. } => ErrorKind::ShutdownError,
            BridgeError::Engine(_) | BridgeError::SimulationEnded(_) => ErrorKind::Engine,
            BridgeError::Bus(_) => ErrorKind::Bus,
            BridgeError::InvalidState(_) => ErrorKind::InvalidState,
        }
    }

    /// Shorthand used by plugins for per-step failures.
    pub fn step(device: impl Into<String>, details: impl Into<String>) -> Self {
        BridgeError::StepError {
            device: device.into(),
            details: details.into(),
        }
    }

    /// Shorthand used by plugins and the resolver for configuration errors.
    pub fn config(device: impl Into<String>, details: impl Into<String>) -> Self {
        BridgeError::InvalidConfig {
            device: device.into(),
            details: details.into(),
        }
    }
}

/// A reported, non-fatal problem attributed to one device (or type tag).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Device name the problem is attributed to.
    pub device: String,
    pub kind: ErrorKind,
    pub message: String,
    /// Simulation step, when the problem arose while ticking.
    pub step: Option<u64>,
}

impl Diagnostic {
    /// Build a diagnostic from an error, keeping the error's kind.
    pub fn from_error(device: impl Into<String>, error: &BridgeError, step: Option<u64>) -> Self {
        Self {
            device: device.into(),
            kind: error.kind(),
            message: error.to_string(),
            step,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.step {
            Some(step) => write!(f, "[{}] {} @ step {}: {}", self.kind, self.device, step, self.message),
            None => write!(f, "[{}] {}: {}", self.kind, self.device, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        let err = BridgeError::UnknownDeviceType {
            device: "bad".to_string(),
            type_tag: "unknown".to_string(),
            details: "no factory".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::UnknownDeviceType);
        assert_eq!(BridgeError::step("ps0", "x").kind(), ErrorKind::StepError);
        assert_eq!(BridgeError::config("ps0", "x").kind(), ErrorKind::InvalidConfig);
        assert_eq!(
            BridgeError::DuplicateTypeTag("range".into()).kind(),
            ErrorKind::DuplicateTypeTag
        );
    }

    #[test]
    fn error_display_names_device() {
        let err = BridgeError::DeviceSuspended {
            device: "cam0".to_string(),
            failures: 10,
        };
        let text = err.to_string();
        assert!(text.contains("cam0"));
        assert!(text.contains("10"));
    }

    #[test]
    fn diagnostic_keeps_kind_and_device() {
        let err = BridgeError::DeviceNotFound {
            device: "tof".to_string(),
            details: "not in world".to_string(),
        };
        let diag = Diagnostic::from_error("tof", &err, None);
        assert_eq!(diag.kind, ErrorKind::DeviceNotFound);
        assert_eq!(diag.device, "tof");
        assert!(diag.to_string().starts_with("[device_not_found] tof"));

        let diag = Diagnostic::from_error("tof", &err, Some(12));
        assert!(diag.to_string().contains("@ step 12"));
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::DuplicateDeviceName).unwrap();
        assert_eq!(json, "\"duplicate_device_name\"");
        assert_eq!(ErrorKind::DuplicateDeviceName.to_string(), "duplicate_device_name");
    }
}
