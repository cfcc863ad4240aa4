//! Lifecycle event bus.
//!
//! Container and image mutations are published as Docker-style events and
//! fanned out to every `/events` subscriber.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::broadcast;

/// Events buffered per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 256;

/// Object an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A container.
    Container,
    /// An image.
    Image,
}

impl EventKind {
    /// Docker spelling of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Image => "image",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Object type.
    pub kind: EventKind,
    /// Action, e.g. `create`, `die` or `untag`.
    pub action: String,
    /// Id of the object.
    pub actor_id: String,
    /// Actor attributes such as `name` and `image`.
    pub attributes: BTreeMap<String, String>,
    /// When the event happened.
    pub time: DateTime<Utc>,
}

impl Event {
    /// A container event carrying the container's name without its slash.
    #[must_use]
    pub fn container(action: &str, id: &str, name: &str) -> Self {
        Self {
            kind: EventKind::Container,
            action: action.to_string(),
            actor_id: id.to_string(),
            attributes: BTreeMap::from([(
                "name".to_string(),
                name.trim_start_matches('/').to_string(),
            )]),
            time: Utc::now(),
        }
    }

    /// An image event carrying the reference it concerns.
    #[must_use]
    pub fn image(action: &str, id: &str, reference: &str) -> Self {
        Self {
            kind: EventKind::Image,
            action: action.to_string(),
            actor_id: id.to_string(),
            attributes: BTreeMap::from([("name".to_string(), reference.to_string())]),
            time: Utc::now(),
        }
    }

    /// Adds an actor attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

/// Broadcast channel for events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Creates a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Publishes an event. Events published with no subscriber are dropped.
    pub fn publish(&self, event: Event) {
        tracing::trace!(kind = %event.kind, action = %event.action, actor = %event.actor_id, "event");
        let _ = self.sender.send(event);
    }

    /// Receives every event published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
