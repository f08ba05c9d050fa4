//! Robot device descriptor.
//!
//! A [`Descriptor`] is the already-parsed, ordered list of
//! [`DeviceDeclaration`]s for one robot.  Declarations are immutable once
//! parsed; the order in which they appear is the order in which devices are
//! initialised and ticked.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// The full device descriptor for one robot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Robot name, used only for logging.
    #[serde(default)]
    pub name: String,
    /// Ordered device declarations.
    #[serde(default)]
    pub devices: Vec<DeviceDeclaration>,
}

/// One device declaration: which device to expose, with which plugin, and
/// how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDeclaration {
    /// Device-type tag, matched against the plugin registry and the engine
    /// device's own type (e.g. `"range"`, `"image"`).
    #[serde(rename = "type")]
    pub device_type: String,
    /// Engine device name; unique within a robot.
    pub name: String,
    /// Raw configuration.  Scalar TOML/JSON values are stored as strings.
    #[serde(default, deserialize_with = "scalar_map")]
    pub config: BTreeMap<String, String>,
    /// Child declarations of a composite device, in declaration order.
    #[serde(default)]
    pub children: Vec<DeviceDeclaration>,
}

impl DeviceDeclaration {
    pub fn new(device_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            device_type: device_type.into(),
            name: name.into(),
            config: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    /// Builder-style helper that sets one configuration entry.
    pub fn with_config(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.config.insert(key.into(), value.to_string());
        self
    }

    /// Builder-style helper that appends a composite child.
    pub fn with_child(mut self, child: DeviceDeclaration) -> Self {
        self.children.push(child);
        self
    }

    /// Look up a raw configuration value.
    pub fn config_value(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Str(s) => s,
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Bool(b) => b.to_string(),
        }
    }
}

fn scalar_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, Scalar>::deserialize(deserializer)?;
    Ok(raw.into_iter().map(|(k, v)| (k, v.into_string())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_helpers_set_fields() {
        let decl = DeviceDeclaration::new("imu", "inertial unit")
            .with_config("period", 4)
            .with_child(DeviceDeclaration::new("gyro", "gyro"));
        assert_eq!(decl.config_value("period"), Some("4"));
        assert_eq!(decl.children.len(), 1);
        assert_eq!(decl.children[0].device_type, "gyro");
        assert!(decl.config_value("missing").is_none());
    }

    #[test]
    fn toml_scalars_are_stringified() {
        let raw = r#"
            name = "epuck"

            [[devices]]
            type = "range"
            name = "ps0"
            config = { period = 3, topic = "/distance/ps0", enabled = true, gain = 0.5 }

            [[devices]]
            type = "imu"
            name = "inertial unit"
            [[devices.children]]
            type = "gyro"
            name = "gyro"
        "#;
        let descriptor: Descriptor = toml::from_str(raw).unwrap();
        assert_eq!(descriptor.name, "epuck");
        assert_eq!(descriptor.devices.len(), 2);

        let ps0 = &descriptor.devices[0];
        assert_eq!(ps0.config_value("period"), Some("3"));
        assert_eq!(ps0.config_value("topic"), Some("/distance/ps0"));
        assert_eq!(ps0.config_value("enabled"), Some("true"));
        assert_eq!(ps0.config_value("gain"), Some("0.5"));

        let imu = &descriptor.devices[1];
        assert!(imu.config.is_empty());
        assert_eq!(imu.children[0].name, "gyro");
    }

    #[test]
    fn robot_name_is_optional() {
        let descriptor: Descriptor = toml::from_str("[[devices]]\ntype = \"led\"\nname = \"led0\"").unwrap();
        assert!(descriptor.name.is_empty());
        assert_eq!(descriptor.devices[0].name, "led0");
    }

    #[test]
    fn json_declaration_uses_type_key() {
        let decl = DeviceDeclaration::new("led", "led0").with_config("period", 2);
        let json = serde_json::to_string(&decl).unwrap();
        assert!(json.contains("\"type\":\"led\""));
        let back: DeviceDeclaration = serde_json::from_str(&json).unwrap();
        assert_eq!(back, decl);
    }
}
