//! `simbridge-types` – shared data model for the simulation bridge.
//!
//! # Modules
//!
//! - [`descriptor`] – [`Descriptor`] and [`DeviceDeclaration`]: the parsed
//!   robot device descriptor consumed by the resolver.
//! - [`message`] – payloads published on the message bus ([`Message`]) and
//!   the [`MessageSchema`] tag publishers are created with.
//! - [`error`] – [`BridgeError`], [`ErrorKind`] and [`Diagnostic`], shared by
//!   every crate in the workspace.

pub mod descriptor;
pub mod error;
pub mod message;

pub use descriptor::{Descriptor, DeviceDeclaration};
pub use error::{BridgeError, Diagnostic, ErrorKind};
pub use message::{
    Header, ImageMsg, ImuMsg, LedCommand, LedState, Message, MessageSchema, OdometryMsg,
    Quaternion, RadiationType, RangeMsg, Twist, Vector3,
};
