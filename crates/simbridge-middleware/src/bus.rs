//! Topic-based publish/subscribe message bus.
//!
//! [`MessageBus`] is the contract plugins publish through.  [`EventBus`] is
//! the in-process implementation: one [`tokio::sync::broadcast`] channel per
//! topic plus a global tap channel that sees every message.
//!
//! Publishing never blocks.  A slow subscriber falls behind and is told how
//! many messages it missed; the publisher is never held up.  When nobody is
//! listening on a topic, the message is dropped and `publish` returns `Ok(0)`.
//!
//! | Operation | Failure |
//! |---|---|
//! | `create_publisher` | topic already carries another [`MessageSchema`] |
//! | `publish` | unknown/destroyed publisher, or payload schema mismatch |
//! | `destroy_publisher` | unknown/already destroyed publisher |

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use simbridge_types::{BridgeError, Message, MessageSchema};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default channel capacity (number of buffered messages before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// A message as delivered to subscribers.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub message: Message,
}

/// Handle returned by [`MessageBus::create_publisher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherHandle {
    id: u64,
    topic: String,
    schema: MessageSchema,
}

impl PublisherHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn schema(&self) -> MessageSchema {
        self.schema
    }
}

/// Capability contract of the bus as seen by device plugins.
pub trait MessageBus: Send + Sync {
    /// Register a publisher for `topic` carrying `schema` payloads.
    fn create_publisher(&self, topic: &str, schema: MessageSchema) -> Result<PublisherHandle, BridgeError>;

    /// Hand `message` to every subscriber of the publisher's topic.
    ///
    /// Returns the number of subscribers the message was delivered to.
    fn publish(&self, publisher: &PublisherHandle, message: Message) -> Result<usize, BridgeError>;

    /// Release a publisher.
    fn destroy_publisher(&self, publisher: PublisherHandle) -> Result<(), BridgeError>;

    /// Subscribe to `topic` (used by actuator plugins for command topics).
    fn subscribe(&self, topic: &str, schema: MessageSchema) -> Result<Subscription, BridgeError>;
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

struct TopicChannel {
    schema: MessageSchema,
    sender: broadcast::Sender<Envelope>,
}

#[derive(Default)]
struct BusState {
    topics: HashMap<String, TopicChannel>,
    publishers: HashMap<u64, String>,
}

struct Inner {
    capacity: usize,
    next_id: AtomicU64,
    tap: broadcast::Sender<Envelope>,
    state: Mutex<BusState>,
}

/// Shared in-process bus.  Clone it cheaply – all clones share the same
/// channels and publisher table.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Create a new bus with the given per-topic channel capacity.
    ///
    /// # Panics
    ///
    /// Panics when `capacity` is zero (a Tokio broadcast requirement).
    pub fn new(capacity: usize) -> Self {
        let (tap, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(Inner {
                capacity,
                next_id: AtomicU64::new(1),
                tap,
                state: Mutex::new(BusState::default()),
            }),
        }
    }

    /// Subscribe to every message published on any topic.
    pub fn subscribe_all(&self) -> Subscription {
        Subscription {
            topic: None,
            receiver: self.inner.tap.subscribe(),
        }
    }

    /// Number of live publishers.
    pub fn publisher_count(&self) -> usize {
        self.lock().publishers.len()
    }

    /// Topics of the live publishers, sorted.
    pub fn published_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.lock().publishers.values().cloned().collect();
        topics.sort();
        topics
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn channel<'a>(
        &self,
        state: &'a mut BusState,
        topic: &str,
        schema: MessageSchema,
    ) -> Result<&'a TopicChannel, BridgeError> {
        let capacity = self.inner.capacity;
        let channel = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicChannel {
                schema,
                sender: broadcast::channel(capacity).0,
            });
        if channel.schema != schema {
            return Err(BridgeError::Bus(format!(
                "topic '{topic}' carries {:?}, not {schema:?}",
                channel.schema
            )));
        }
        Ok(channel)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MessageBus for EventBus {
    fn create_publisher(&self, topic: &str, schema: MessageSchema) -> Result<PublisherHandle, BridgeError> {
        let mut state = self.lock();
        self.channel(&mut state, topic, schema)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        state.publishers.insert(id, topic.to_string());
        debug!(topic, ?schema, id, "publisher created");
        Ok(PublisherHandle {
            id,
            topic: topic.to_string(),
            schema,
        })
    }

    fn publish(&self, publisher: &PublisherHandle, message: Message) -> Result<usize, BridgeError> {
        if message.schema() != publisher.schema {
            return Err(BridgeError::Bus(format!(
                "publisher on '{}' expects {:?}, got {:?}",
                publisher.topic,
                publisher.schema,
                message.schema()
            )));
        }
        let sender = {
            let state = self.lock();
            if !state.publishers.contains_key(&publisher.id) {
                return Err(BridgeError::Bus(format!(
                    "publisher {} on '{}' is not registered",
                    publisher.id, publisher.topic
                )));
            }
            state
                .topics
                .get(&publisher.topic)
                .map(|c| c.sender.clone())
                .ok_or_else(|| BridgeError::Bus(format!("topic '{}' vanished", publisher.topic)))?
        };

        let envelope = Envelope {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            topic: publisher.topic.clone(),
            message,
        };
        // Send errors only mean "no receivers right now"; the message is
        // dropped, as on any best-effort topic.
        let _ = self.inner.tap.send(envelope.clone());
        Ok(sender.send(envelope).unwrap_or(0))
    }

    fn destroy_publisher(&self, publisher: PublisherHandle) -> Result<(), BridgeError> {
        match self.lock().publishers.remove(&publisher.id) {
            Some(_) => {
                debug!(topic = %publisher.topic, id = publisher.id, "publisher destroyed");
                Ok(())
            }
            None => Err(BridgeError::Bus(format!(
                "publisher {} on '{}' is not registered",
                publisher.id, publisher.topic
            ))),
        }
    }

    fn subscribe(&self, topic: &str, schema: MessageSchema) -> Result<Subscription, BridgeError> {
        let mut state = self.lock();
        let channel = self.channel(&mut state, topic, schema)?;
        Ok(Subscription {
            topic: Some(topic.to_string()),
            receiver: channel.sender.subscribe(),
        })
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Receiving end of a topic (or of the global tap).
pub struct Subscription {
    topic: Option<String>,
    receiver: broadcast::Receiver<Envelope>,
}

impl Subscription {
    /// Take the next pending message without waiting.
    ///
    /// Returns `None` when nothing is pending.  Lagging behind is logged and
    /// skipped over.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "subscription lagged");
                    continue;
                }
                Err(_) => return None,
            }
        }
    }

    /// Take every pending message without waiting.
    pub fn drain(&mut self) -> Vec<Envelope> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Take only the most recent pending message, discarding older ones.
    pub fn latest(&mut self) -> Option<Envelope> {
        std::iter::from_fn(|| self.try_recv()).last()
    }

    /// Wait for the next message.
    ///
    /// Returns `None` once the bus has been dropped.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "subscription lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Topic this subscription is bound to; `None` for the global tap.
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }
}
