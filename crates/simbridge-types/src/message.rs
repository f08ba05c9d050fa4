//! Payloads carried by the message bus.
//!
//! Every publisher is created for exactly one [`MessageSchema`]; the bus
//! rejects a [`Message`] whose [`Message::schema`] does not match.

use serde::{Deserialize, Serialize};

/// Tag identifying the payload type a publisher or subscription carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSchema {
    Range,
    Image,
    Imu,
    Odometry,
    LedState,
    LedCommand,
    Twist,
}

/// Stamp shared by every sensor payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// Simulation step index the reading was taken at.
    pub step: u64,
    /// Simulation time in seconds.
    pub stamp: f64,
    pub frame_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Build from an `[x, y, z]` array as returned by three-axis sensors.
    pub fn from_array(v: [f64; 3]) -> Self {
        Self::new(v[0], v[1], v[2])
    }
}

/// Unit quaternion (x, y, z, w).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Quaternion {
    pub fn identity() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
        }
    }

    /// Convert roll/pitch/yaw (radians, intrinsic Z-Y-X) to a quaternion.
    pub fn from_euler(roll: f64, pitch: f64, yaw: f64) -> Self {
        let (sr, cr) = (roll / 2.0).sin_cos();
        let (sp, cp) = (pitch / 2.0).sin_cos();
        let (sy, cy) = (yaw / 2.0).sin_cos();
        Self {
            x: sr * cp * cy - cr * sp * sy,
            y: cr * sp * cy + sr * cp * sy,
            z: cr * cp * sy - sr * sp * cy,
            w: cr * cp * cy + sr * sp * sy,
        }
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::identity()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadiationType {
    Ultrasound,
    Infrared,
}

/// Single range reading from a distance sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeMsg {
    pub header: Header,
    pub radiation_type: RadiationType,
    /// Sensor aperture in radians.
    pub field_of_view: f64,
    pub min_range: f64,
    pub max_range: f64,
    pub range: f64,
}

/// Raw camera frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMsg {
    pub header: Header,
    pub width: u32,
    pub height: u32,
    /// Pixel encoding, e.g. `"bgra8"`.
    pub encoding: String,
    pub is_bigendian: bool,
    /// Row length in bytes.
    pub step: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImuMsg {
    pub header: Header,
    pub orientation: Quaternion,
    pub angular_velocity: Vector3,
    pub linear_acceleration: Vector3,
}

/// Pose and velocity of a mobile base, expressed in `header.frame_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OdometryMsg {
    pub header: Header,
    pub child_frame_id: String,
    pub position: Vector3,
    pub orientation: Quaternion,
    pub linear_velocity: Vector3,
    pub angular_velocity: Vector3,
}

/// Velocity command for a mobile base.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Twist {
    pub linear: Vector3,
    pub angular: Vector3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedState {
    pub header: Header,
    pub value: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedCommand {
    pub value: i32,
}

/// Every payload the bus can carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Message {
    Range(RangeMsg),
    Image(ImageMsg),
    Imu(ImuMsg),
    Odometry(OdometryMsg),
    LedState(LedState),
    LedCommand(LedCommand),
    Twist(Twist),
}

impl Message {
    pub fn schema(&self) -> MessageSchema {
        match self {
            Message::Range(_) => MessageSchema::Range,
            Message::Image(_) => MessageSchema::Image,
            Message::Imu(_) => MessageSchema::Imu,
            Message::Odometry(_) => MessageSchema::Odometry,
            Message::LedState(_) => MessageSchema::LedState,
            Message::LedCommand(_) => MessageSchema::LedCommand,
            Message::Twist(_) => MessageSchema::Twist,
        }
    }

    /// Header of sensor payloads; command payloads carry none.
    pub fn header(&self) -> Option<&Header> {
        match self {
            Message::Range(m) => Some(&m.header),
            Message::Image(m) => Some(&m.header),
            Message::Imu(m) => Some(&m.header),
            Message::Odometry(m) => Some(&m.header),
            Message::LedState(m) => Some(&m.header),
            Message::LedCommand(_) | Message::Twist(_) => None,
        }
    }

    pub fn header_mut(&mut self) -> Option<&mut Header> {
        match self {
            Message::Range(m) => Some(&mut m.header),
            Message::Image(m) => Some(&mut m.header),
            Message::Imu(m) => Some(&mut m.header),
            Message::Odometry(m) => Some(&mut m.header),
            Message::LedState(m) => Some(&mut m.header),
            Message::LedCommand(_) | Message::Twist(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn zero_euler_is_identity() {
        let q = Quaternion::from_euler(0.0, 0.0, 0.0);
        assert_eq!(q, Quaternion::identity());
    }

    #[test]
    fn yaw_only_rotation() {
        let yaw = std::f64::consts::FRAC_PI_2;
        let q = Quaternion::from_euler(0.0, 0.0, yaw);
        assert!(approx(q.x, 0.0));
        assert!(approx(q.y, 0.0));
        assert!(approx(q.z, (yaw / 2.0).sin()));
        assert!(approx(q.w, (yaw / 2.0).cos()));
    }

    #[test]
    fn euler_quaternion_is_unit_length() {
        let q = Quaternion::from_euler(0.3, -0.7, 2.1);
        let norm = (q.x * q.x + q.y * q.y + q.z * q.z + q.w * q.w).sqrt();
        assert!(approx(norm, 1.0));
    }

    #[test]
    fn schema_and_header_match_variant() {
        let msg = Message::LedState(LedState {
            header: Header {
                step: 7,
                stamp: 0.224,
                frame_id: "led0".to_string(),
            },
            value: 1,
        });
        assert_eq!(msg.schema(), MessageSchema::LedState);
        assert_eq!(msg.header().map(|h| h.step), Some(7));

        let cmd = Message::Twist(Twist::default());
        assert_eq!(cmd.schema(), MessageSchema::Twist);
        assert!(cmd.header().is_none());
    }

    #[test]
    fn header_mut_restamps_sensor_payloads() {
        let mut msg = Message::LedState(LedState {
            header: Header {
                step: 0,
                stamp: 0.0,
                frame_id: "wrong".to_string(),
            },
            value: 1,
        });
        if let Some(header) = msg.header_mut() {
            header.step = 3;
            header.frame_id = "led0".to_string();
        }
        assert_eq!(msg.header().map(|h| (h.step, h.frame_id.as_str())), Some((3, "led0")));

        let mut cmd = Message::LedCommand(LedCommand { value: 1 });
        assert!(cmd.header_mut().is_none());
    }

    #[test]
    fn message_json_is_tagged() {
        let msg = Message::LedCommand(LedCommand { value: 3 });
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"kind":"led_command","data":{"value":3}}"#);
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
