use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::utils::timestamp_millis;

pub use crate::utils::TimestampMillis;

pub type DashSet<V> = dashmap::DashSet<V, ahash::RandomState>;
pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

///topic name, also carried as the message type
pub type Topic = String;
pub type MessageId = String;
pub type MessageType = String;
pub type SubscriptionId = String;
pub type BrokerName = String;
pub type Metadata = Map<String, Value>;
pub type Headers = std::collections::BTreeMap<String, String>;

/// Delivery priority of a message, higher values drain first.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Priority {
    #[inline]
    pub fn value(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// The in-memory message shape every adapter must round-trip.
///
/// `typ` is the topic the message was published to; it is serialized as
/// `type`. Messages are treated as immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub typ: MessageType,
    pub payload: Value,
    pub timestamp: TimestampMillis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl Message {
    #[inline]
    pub fn new<T: Into<MessageType>>(typ: T, payload: Value) -> Self {
        Self {
            id: new_message_id(),
            typ: typ.into(),
            payload,
            timestamp: timestamp_millis(),
            priority: None,
            metadata: None,
            headers: None,
            partition: None,
            subject: None,
            channel: None,
        }
    }

    #[inline]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    #[inline]
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    #[inline]
    pub fn header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.get_or_insert_with(Headers::default).insert(key.into(), value.into());
        self
    }

    #[inline]
    pub fn partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    #[inline]
    pub fn subject<S: Into<String>>(mut self, subject: S) -> Self {
        self.subject = Some(subject.into());
        self
    }

    #[inline]
    pub fn channel<S: Into<String>>(mut self, channel: S) -> Self {
        self.channel = Some(channel.into());
        self
    }

    ///Priority used for ordering, absent means normal
    #[inline]
    pub fn effective_priority(&self) -> Priority {
        self.priority.unwrap_or_default()
    }

    ///Looks `key` up in the payload first, then in the metadata
    #[inline]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key).or_else(|| self.metadata.as_ref().and_then(|m| m.get(key)))
    }
}

/// 128-bit random identifier, hex encoded without dashes.
#[inline]
pub fn new_message_id() -> MessageId {
    Uuid::new_v4().simple().to_string()
}

/// Options accepted by the orchestrator when it builds a message for a topic.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub priority: Option<Priority>,
    pub metadata: Option<Metadata>,
    pub headers: Option<Headers>,
    pub partition: Option<i32>,
    pub subject: Option<String>,
    pub channel: Option<String>,
}

impl PublishOptions {
    #[inline]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    #[inline]
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    #[inline]
    pub fn header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.get_or_insert_with(Headers::default).insert(key.into(), value.into());
        self
    }

    #[inline]
    pub fn partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    #[inline]
    pub fn subject<S: Into<String>>(mut self, subject: S) -> Self {
        self.subject = Some(subject.into());
        self
    }

    #[inline]
    pub fn channel<S: Into<String>>(mut self, channel: S) -> Self {
        self.channel = Some(channel.into());
        self
    }

    #[inline]
    pub(crate) fn into_message(self, topic: &str, payload: Value) -> Message {
        let mut msg = Message::new(topic, payload);
        msg.priority = self.priority;
        msg.metadata = self.metadata;
        msg.headers = self.headers;
        msg.partition = self.partition;
        msg.subject = self.subject;
        msg.channel = self.channel;
        msg
    }
}

/// Options forwarded to the adapter on subscribe, opaque to the core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub consumer_group: Option<String>,
    pub queue_group: Option<String>,
}

impl SubscribeOptions {
    ///Load-balancing group, queue group wins when both are set
    #[inline]
    pub fn group(&self) -> Option<&str> {
        self.queue_group.as_deref().or(self.consumer_group.as_deref())
    }
}
