//! Differential-drive base: `Twist` in, `Odometry` out.
//!
//! Velocity commands arriving on `cmd_vel_topic` are converted to wheel
//! angular velocities:
//!
//! ```text
//! left  = (2v − ω·L) / (2r)
//! right = (2v + ω·L) / (2r)
//! ```
//!
//! Odometry is computed from the wheel encoder deltas over the time elapsed
//! since the previous invocation, and the planar pose is integrated with
//! fourth-order Runge–Kutta.
//!
//! | Key | Default |
//! |---|---|
//! | `wheel_radius` | `0.02` m |
//! | `wheel_distance` | `0.05685` m |
//! | `cmd_vel_topic` | `/cmd_vel` |
//! | `topic` | `/odom` |
//! | `odom_frame` | `odom` |
//! | `child_frame` | `base_link` |

use simbridge_hal::{DeviceCommand, DeviceHandle, DeviceReading};
use simbridge_middleware::{MessageBus, PublisherHandle, Subscription};
use simbridge_types::{BridgeError, Message, MessageSchema, OdometryMsg, Quaternion, Twist, Vector3};
use tracing::debug;

use crate::plugin::{
    DeviceConfig, DevicePlugin, InitContext, PluginFactory, StepContext, factory_fn,
    release_publisher, require_publisher,
};
use crate::plugins::{init_publisher, unexpected_reading};

pub const DEFAULT_WHEEL_RADIUS: f64 = 0.02;
pub const DEFAULT_WHEEL_DISTANCE: f64 = 0.05685;
pub const DEFAULT_CMD_VEL_TOPIC: &str = "/cmd_vel";
pub const DEFAULT_ODOM_TOPIC: &str = "/odom";

pub fn factory() -> PluginFactory {
    factory_fn(|handle: &DeviceHandle, config: &DeviceConfig| {
        Ok(Box::new(DiffDrivePlugin::new(handle, config)?) as Box<dyn DevicePlugin>)
    })
}

/// Planar pose in the odometry frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Pose2D {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}

/// Wheel geometry of a differential-drive base.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WheelGeometry {
    pub radius: f64,
    pub distance: f64,
}

impl WheelGeometry {
    /// Wheel angular velocities (rad/s) for a body velocity command.
    pub fn wheel_velocities(&self, linear: f64, angular: f64) -> (f64, f64) {
        let left = (2.0 * linear - angular * self.distance) / (2.0 * self.radius);
        let right = (2.0 * linear + angular * self.distance) / (2.0 * self.radius);
        (left, right)
    }

    /// Body velocities `(v, ω)` from wheel rotations (rad) over `dt` seconds.
    pub fn body_velocities(&self, d_left: f64, d_right: f64, dt: f64) -> (f64, f64) {
        if dt <= 0.0 {
            return (0.0, 0.0);
        }
        let v_left = d_left / dt * self.radius;
        let v_right = d_right / dt * self.radius;
        ((v_left + v_right) / 2.0, (v_right - v_left) / self.distance)
    }
}

/// Advance `pose` by `dt` seconds at constant `v` and `omega` with RK4.
pub fn integrate_rk4(pose: Pose2D, v: f64, omega: f64, dt: f64) -> Pose2D {
    let derivative = |theta: f64| (v * theta.cos(), v * theta.sin(), omega);
    let k1 = derivative(pose.theta);
    let k2 = derivative(pose.theta + dt * k1.2 / 2.0);
    let k3 = derivative(pose.theta + dt * k2.2 / 2.0);
    let k4 = derivative(pose.theta + dt * k3.2);
    Pose2D {
        x: pose.x + dt / 6.0 * (k1.0 + 2.0 * (k2.0 + k3.0) + k4.0),
        y: pose.y + dt / 6.0 * (k1.1 + 2.0 * (k2.1 + k3.1) + k4.1),
        theta: pose.theta + dt / 6.0 * (k1.2 + 2.0 * (k2.2 + k3.2) + k4.2),
    }
}

pub struct DiffDrivePlugin {
    device: String,
    geometry: WheelGeometry,
    topic: String,
    cmd_vel_topic: String,
    odom_frame: String,
    child_frame: String,
    pose: Pose2D,
    encoders: (f64, f64),
    publisher: Option<PublisherHandle>,
    commands: Option<Subscription>,
}

impl DiffDrivePlugin {
    /// # Errors
    ///
    /// [`BridgeError::InvalidConfig`] for non-positive wheel geometry.
    pub fn new(handle: &DeviceHandle, config: &DeviceConfig) -> Result<Self, BridgeError> {
        let geometry = WheelGeometry {
            radius: config.f64_or("wheel_radius", DEFAULT_WHEEL_RADIUS)?,
            distance: config.f64_or("wheel_distance", DEFAULT_WHEEL_DISTANCE)?,
        };
        if geometry.radius <= 0.0 || geometry.distance <= 0.0 {
            return Err(BridgeError::config(
                &handle.name,
                "'wheel_radius' and 'wheel_distance' must be positive",
            ));
        }
        Ok(Self {
            device: handle.name.clone(),
            geometry,
            topic: config.get("topic").unwrap_or(DEFAULT_ODOM_TOPIC).to_string(),
            cmd_vel_topic: config.string_or("cmd_vel_topic", DEFAULT_CMD_VEL_TOPIC),
            odom_frame: config.string_or("odom_frame", "odom"),
            child_frame: config.string_or("child_frame", "base_link"),
            pose: Pose2D::default(),
            encoders: (0.0, 0.0),
            publisher: None,
            commands: None,
        })
    }

    pub fn pose(&self) -> Pose2D {
        self.pose
    }

    fn apply_command(&self, ctx: &mut StepContext<'_>, twist: &Twist) -> Result<(), BridgeError> {
        let (left, right) = self.geometry.wheel_velocities(twist.linear.x, twist.angular.z);
        debug!(device = %self.device, left, right, "wheel velocities commanded");
        ctx.engine
            .command(ctx.handle, DeviceCommand::WheelVelocities { left, right })
    }
}

impl DevicePlugin for DiffDrivePlugin {
    fn init(&mut self, ctx: &InitContext<'_>) -> Result<(), BridgeError> {
        self.encoders = match ctx.engine.read(ctx.handle) {
            Ok(DeviceReading::WheelEncoders { left, right }) => (left, right),
            Ok(other) => {
                return Err(BridgeError::InitError {
                    device: self.device.clone(),
                    details: format!("expected wheel encoders, got {other:?}"),
                });
            }
            Err(e) => {
                return Err(BridgeError::InitError {
                    device: self.device.clone(),
                    details: e.to_string(),
                });
            }
        };
        self.publisher = Some(init_publisher(
            &self.device,
            ctx.bus,
            &self.topic,
            MessageSchema::Odometry,
        )?);
        self.commands = Some(
            ctx.bus
                .subscribe(&self.cmd_vel_topic, MessageSchema::Twist)
                .map_err(|e| BridgeError::InitError {
                    device: self.device.clone(),
                    details: e.to_string(),
                })?,
        );
        Ok(())
    }

    fn on_step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), BridgeError> {
        let latest = self.commands.as_mut().and_then(Subscription::latest);
        if let Some(envelope) = latest
            && let Message::Twist(twist) = &envelope.message
        {
            self.apply_command(ctx, twist)?;
        }

        let (left, right) = match ctx.engine.read(ctx.handle)? {
            DeviceReading::WheelEncoders { left, right } => (left, right),
            other => return Err(unexpected_reading(&self.device, &other)),
        };
        let dt = ctx.elapsed.as_secs_f64();
        let (v, omega) = self.geometry.body_velocities(
            left - self.encoders.0,
            right - self.encoders.1,
            dt,
        );
        self.pose = integrate_rk4(self.pose, v, omega, dt);
        self.encoders = (left, right);

        let msg = OdometryMsg {
            header: ctx.header(&self.odom_frame),
            child_frame_id: self.child_frame.clone(),
            position: Vector3::new(self.pose.x, self.pose.y, 0.0),
            orientation: Quaternion::from_euler(0.0, 0.0, self.pose.theta),
            linear_velocity: Vector3::new(v, 0.0, 0.0),
            angular_velocity: Vector3::new(0.0, 0.0, omega),
        };
        let publisher = require_publisher(&self.device, &self.publisher)?;
        ctx.bus
            .publish(publisher, Message::Odometry(msg))
            .map_err(|e| BridgeError::step(&self.device, e.to_string()))?;
        Ok(())
    }

    fn shutdown(&mut self, bus: &dyn MessageBus) -> Result<(), BridgeError> {
        self.commands = None;
        release_publisher(bus, &mut self.publisher)
    }
}
