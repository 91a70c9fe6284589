//! Channels and the subscriber entries they hold.
//!
//! A channel is a named topic. Each subscription is recorded as a
//! `(subscription_id, client_id)` pair in insertion order.

use std::fmt;
use tracing::debug;

pub use eventual_protocol::client::{validate_channel_name, MAX_CHANNEL_NAME_LENGTH};

/// Wildcard channel whose subscribers receive every publish.
pub const GLOBAL_CHANNEL: &str = "global";

/// A channel identifier.
pub type ChannelId = String;

/// Opaque, globally unique subscription identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SubscriptionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One subscription on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub subscription_id: SubscriptionId,
    /// Network identity of the subscriber (remote address or peer address).
    pub client_id: String,
}

/// A named topic and its subscribers.
#[derive(Debug, Clone)]
pub struct Channel {
    name: ChannelId,
    subscribers: Vec<Subscriber>,
}

impl Channel {
    /// Create a new, empty channel.
    #[must_use]
    pub fn new(name: impl Into<ChannelId>) -> Self {
        Self {
            name: name.into(),
            subscribers: Vec::new(),
        }
    }

    /// Get the channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is the wildcard channel.
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.name == GLOBAL_CHANNEL
    }

    /// Get the number of subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Check if a client holds at least one subscription here.
    #[must_use]
    pub fn is_subscribed(&self, client_id: &str) -> bool {
        self.subscribers.iter().any(|s| s.client_id == client_id)
    }

    /// Append a subscription for `client_id` and return its fresh id.
    pub fn subscribe(&mut self, client_id: impl Into<String>) -> SubscriptionId {
        let subscriber = Subscriber {
            subscription_id: SubscriptionId::generate(),
            client_id: client_id.into(),
        };
        debug!(
            channel = %self.name,
            client = %subscriber.client_id,
            subscription = %subscriber.subscription_id,
            "Subscriber added"
        );
        let id = subscriber.subscription_id.clone();
        self.subscribers.push(subscriber);
        id
    }

    /// Remove the entry with `id`. Returns `true` if it was present.
    pub fn remove_subscription(&mut self, id: &SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| &s.subscription_id != id);
        before != self.subscribers.len()
    }

    /// Remove every entry belonging to `client_id`. Returns how many were removed.
    pub fn remove_client(&mut self, client_id: &str) -> usize {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.client_id != client_id);
        before - self.subscribers.len()
    }

    /// Subscribers in insertion order.
    #[must_use]
    pub fn subscribers(&self) -> &[Subscriber] {
        &self.subscribers
    }

    /// Check if the channel is empty (no subscribers).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
