//! Message envelope and topic addressing.
//!
//! The [`Message`] envelope is the unit of exchange on every transport.
//! Topics partition the message space; replies flow over a derived topic
//! (`{topic}/reply`). The envelope is treated as immutable once handed to a
//! transport: codecs work on a clone and retain no references.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod future;

pub use future::ReplyFuture;

/// Suffix appended to a topic to derive its reply topic.
///
/// The suffix is reserved: user-defined topics ending in it collide with
/// reply routing and the resulting behaviour is undefined.
pub const REPLY_SUFFIX: &str = "/reply";

/// A topic address. Messages are partitioned purely by topic (and optional
/// consumer group); there is no content-based routing.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Create a topic from its canonical string form.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Derive the topic replies to this topic are published on.
    pub fn reply_topic(&self) -> Topic {
        Topic(format!("{}{}", self.0, REPLY_SUFFIX))
    }

    /// Whether this topic carries replies for another topic.
    pub fn is_reply(&self) -> bool {
        self.0.ends_with(REPLY_SUFFIX)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Topic(name.to_string())
    }
}

impl From<String> for Topic {
    fn from(name: String) -> Self {
        Topic(name)
    }
}

/// One multipart body segment.
///
/// Parts are a transport-layer concern (large uploads, streamed bodies) and
/// never travel through the codec path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Part {
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Group selector meaning broadcast: every subscriber receives the message.
pub const BROADCAST_GROUP: &str = "*";

/// Whether a group selector requests broadcast rather than
/// competing-consumer delivery.
pub fn is_broadcast_group(group: &str) -> bool {
    group.is_empty() || group == BROADCAST_GROUP
}

/// The message envelope.
///
/// `parts`, `future`, and `delivery_mark` never cross the codec boundary:
/// `parts` are transport-level, `future` only exists on the originator side,
/// and `delivery_mark` is assigned by the broker adapter after decode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    /// Producer-assigned message id; carried on the wire and used by the SSE
    /// client to resume a stream.
    pub id: Uuid,
    pub topic: Topic,
    /// Originating logical address.
    pub from_addr: String,
    /// Consumer-group selector; `"*"` or empty means broadcast.
    #[serde(default)]
    pub reply_group: String,
    /// Primary binary body.
    #[serde(default)]
    pub payload: Vec<u8>,
    /// Auxiliary raw body.
    #[serde(default)]
    pub bytes: Vec<u8>,
    /// Free-form headers.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(skip)]
    pub parts: Vec<Part>,
    /// Reply-correlation handle; populated only on the originator side.
    #[serde(skip)]
    pub future: Option<ReplyFuture>,
    /// Broker-assigned entry id (e.g. a stream entry id), used for
    /// acknowledgement.
    #[serde(skip)]
    pub delivery_mark: Option<String>,
}

impl Message {
    /// Create a message with a fresh id.
    pub fn new(
        topic: impl Into<Topic>,
        from_addr: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            from_addr: from_addr.into(),
            payload: payload.into(),
            ..Self::default()
        }
    }

    pub fn with_reply_group(mut self, group: impl Into<String>) -> Self {
        self.reply_group = group.into();
        self
    }

    pub fn with_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.bytes = bytes.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Derive a reply envelope addressed to this message's reply topic.
    ///
    /// The reply carries the originating message id in its metadata under
    /// `"correlates"` and broadcasts so whichever reply subscription is
    /// active receives it.
    pub fn reply(&self, from_addr: impl Into<String>, body: impl Into<Vec<u8>>) -> Message {
        Message::new(self.topic.reply_topic(), from_addr, body)
            .with_reply_group(BROADCAST_GROUP)
            .with_metadata("correlates", self.id.to_string())
    }
}

// `future` is correlation state, not message content.
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.topic == other.topic
            && self.from_addr == other.from_addr
            && self.reply_group == other.reply_group
            && self.payload == other.payload
            && self.bytes == other.bytes
            && self.metadata == other.metadata
            && self.parts == other.parts
            && self.delivery_mark == other.delivery_mark
    }
}

impl Eq for Message {}
