//! `simbridge-middleware` – message bus boundary.
//!
//! Routes device payloads from plugins to subscribers without caring about
//! their meaning.
//!
//! # Modules
//!
//! - [`bus`] – the [`MessageBus`] contract and [`EventBus`], a headless,
//!   topic-based publish/subscribe bus built on Tokio broadcast channels.

pub mod bus;

pub use bus::{Envelope, EventBus, MessageBus, PublisherHandle, Subscription};
