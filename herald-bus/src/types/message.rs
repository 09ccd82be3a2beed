use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{LockToken, MessageId};

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Addressable messaging entity.
///
/// Queues and topics accept sends. Queues and subscriptions are receivable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityPath {
    Queue(String),
    Topic(String),
    Subscription { topic: String, name: String },
}

impl EntityPath {
    pub fn queue(name: impl Into<String>) -> Self {
        Self::Queue(name.into())
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self::Topic(name.into())
    }

    pub fn subscription(topic: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Subscription {
            topic: topic.into(),
            name: name.into(),
        }
    }

    pub fn is_receivable(&self) -> bool {
        !matches!(self, Self::Topic(_))
    }

    pub fn is_sendable(&self) -> bool {
        !matches!(self, Self::Subscription { .. })
    }

    /// The entity a sender publishes to in order to reach this one.
    pub fn send_target(&self) -> EntityPath {
        match self {
            Self::Subscription { topic, .. } => Self::Topic(topic.clone()),
            other => other.clone(),
        }
    }
}

impl fmt::Display for EntityPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue(name) | Self::Topic(name) => f.write_str(name),
            Self::Subscription { topic, name } => write!(f, "{topic}/subscriptions/{name}"),
        }
    }
}

/// How a consumer takes messages off an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Lease the message; it stays on the entity until completed or dead-lettered.
    #[default]
    PeekLock,
    /// Remove on receipt. Failures cannot be dead-lettered.
    ReceiveAndDelete,
}

/// Delivery rule attached to a topic subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SubscriptionFilter {
    #[default]
    All,
    /// Only messages whose label equals the value.
    Label(String),
}

impl SubscriptionFilter {
    pub fn matches(&self, label: Option<&str>) -> bool {
        match self {
            Self::All => true,
            Self::Label(expected) => label == Some(expected.as_str()),
        }
    }
}

/// A message on its way to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub message_id: MessageId,
    pub content_type: String,
    pub label: Option<String>,
    pub ttl: Option<Duration>,
    pub body: Vec<u8>,
}

impl OutboundMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: MessageId::new(),
            content_type: JSON_CONTENT_TYPE.to_string(),
            label: None,
            ttl: None,
            body: body.into(),
        }
    }

    pub fn json<T: Serialize>(payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(payload)?))
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_message_id(mut self, id: impl Into<MessageId>) -> Self {
        self.message_id = id.into();
        self
    }
}

/// A delivered message. The body is never modified after delivery.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message_id: MessageId,
    pub source: EntityPath,
    pub content_type: String,
    pub label: Option<String>,
    pub ttl: Option<Duration>,
    pub body: Vec<u8>,
    /// `None` under [`DeliveryMode::ReceiveAndDelete`].
    pub lock_token: Option<LockToken>,
    pub locked_until: Option<DateTime<Utc>>,
    pub delivery_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// A message parked on an entity's dead-letter sub-queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub message_id: MessageId,
    pub source: EntityPath,
    pub reason: String,
    pub description: String,
    pub label: Option<String>,
    pub body: Vec<u8>,
    pub delivery_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_paths_route_through_their_topic() {
        let sub = EntityPath::subscription("dispatch", "notifications-svc");

        assert_eq!(sub.to_string(), "dispatch/subscriptions/notifications-svc");
        assert_eq!(sub.send_target(), EntityPath::topic("dispatch"));
        assert!(sub.is_receivable());
        assert!(!sub.is_sendable());
        assert!(!EntityPath::topic("dispatch").is_receivable());
    }

    #[test]
    fn label_filter_requires_exact_label() {
        let filter = SubscriptionFilter::Label("billing".into());

        assert!(filter.matches(Some("billing")));
        assert!(!filter.matches(Some("Billing")));
        assert!(!filter.matches(None));
        assert!(SubscriptionFilter::All.matches(None));
    }
}
