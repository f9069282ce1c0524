//! Message bus: local fan-out and broker transports.
//!
//! This module contains:
//! - `Bus` / `Transport` traits: publishing and subscription contracts
//! - `MessageHandler` trait: for processing delivered messages
//! - Bus configuration types and the factory
//! - Implementations: Mailbox (local fan-out), Redis (Pub/Sub and Streams)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::info;

use crate::codec::{CodecError, CodecKind};
use crate::message::{Message, ReplyFuture, Topic};

pub mod mailbox;
pub mod redis;

pub use self::mailbox::{Channel, Mailbox, OverflowPolicy};
pub use self::redis::{RedisBus, RedisBusConfig};

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("mailbox for '{topic}' is at capacity")]
    MailboxFull { topic: Topic },

    #[error("reply timed out")]
    ReplyTimeout,

    #[error("mailbox or channel is closed")]
    Closed,
}

/// Handler failure classification.
///
/// On the Streams transport a retryable failure leaves the entry pending for
/// redelivery; a fatal one acknowledges it so a poison message cannot wedge
/// the group. On Pub/Sub both are log-only.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error("retryable handler failure: {0}")]
    Retryable(String),

    #[error("fatal handler failure: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Handler for messages delivered by a mailbox.
///
/// Receives the message and a [`BusHandle`] so it can publish while
/// processing. Implemented for closures of the same shape.
pub trait MessageHandler: Send + Sync {
    fn handle(
        &self,
        msg: Message,
        bus: BusHandle,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

impl<F> MessageHandler for F
where
    F: Fn(Message, BusHandle) -> BoxFuture<'static, std::result::Result<(), HandlerError>>
        + Send
        + Sync,
{
    fn handle(
        &self,
        msg: Message,
        bus: BusHandle,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        (self)(msg, bus)
    }
}

/// Publishing half of a transport.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Fire-and-forget publish. Returns once the frame is handed to the
    /// broker client.
    async fn send(&self, msg: Message) -> Result<()>;

    /// Publish and wait for the first reply on the derived reply topic.
    ///
    /// The returned future settles with the first reply, or with
    /// [`BusError::ReplyTimeout`] when `timeout` fires; either way it
    /// settles exactly once and the transient reply subscription is torn
    /// down.
    async fn send_for_reply(
        &self,
        timeout: Duration,
        topic: Topic,
        group: &str,
        msg: Message,
    ) -> ReplyFuture;
}

/// Full transport contract: subscription plus publishing.
pub trait Transport: Bus {
    /// Subscribe `handler` to `topic`.
    ///
    /// `group` selects competing-consumer semantics where the broker
    /// supports it; `"*"` (or empty) means broadcast. The returned
    /// [`Channel`] owns the registration; its `err()` reports immediate
    /// subscribe failures.
    fn listen(&self, topic: Topic, group: &str, handler: Arc<dyn MessageHandler>) -> Channel;

    /// A cloneable handle for publishing, as handed to handlers.
    fn bus(&self) -> BusHandle;
}

/// Cheap cloneable publishing handle passed to every handler invocation.
///
/// Handlers that need to publish receive this as an argument; they never
/// hold a reference back into the transport.
#[derive(Clone)]
pub struct BusHandle {
    inner: Arc<dyn Bus>,
}

impl BusHandle {
    pub fn new(inner: Arc<dyn Bus>) -> Self {
        Self { inner }
    }

    /// A handle that drops everything published to it. For mailboxes used
    /// without a broker transport.
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopBus))
    }

    pub async fn send(&self, msg: Message) -> Result<()> {
        self.inner.send(msg).await
    }

    pub async fn send_for_reply(
        &self,
        timeout: Duration,
        topic: Topic,
        group: &str,
        msg: Message,
    ) -> ReplyFuture {
        self.inner.send_for_reply(timeout, topic, group, msg).await
    }
}

impl std::fmt::Debug for BusHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusHandle").finish_non_exhaustive()
    }
}

/// Bus that silently drops published messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBus;

#[async_trait]
impl Bus for NoopBus {
    async fn send(&self, _msg: Message) -> Result<()> {
        Ok(())
    }

    async fn send_for_reply(
        &self,
        _timeout: Duration,
        _topic: Topic,
        _group: &str,
        _msg: Message,
    ) -> ReplyFuture {
        let future = ReplyFuture::new();
        future.settle(Err(BusError::ReplyTimeout));
        future
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Transport shape discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusVariant {
    /// Redis Streams: competing-consumer groups, per-entry acknowledgement.
    #[default]
    Stream,
    /// Redis Pub/Sub: broadcast, no acknowledgement.
    Pubsub,
}

/// Top-level bus configuration (discriminated union).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Transport shape discriminator.
    #[serde(rename = "type")]
    pub variant: BusVariant,
    /// Envelope codec.
    pub codec: CodecKind,
    /// Redis connection URL.
    pub url: String,
    /// Stream consumer name; generated when absent.
    pub consumer_name: Option<String>,
    /// Reconnect attempts before a subscription is failed.
    pub max_retries: u32,
    /// Per-mailbox bounded queue size.
    pub mailbox_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            variant: BusVariant::Stream,
            codec: CodecKind::Json,
            url: "redis://127.0.0.1:6379".to_string(),
            consumer_name: None,
            max_retries: 10,
            mailbox_capacity: 1,
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize a message bus based on configuration.
pub async fn init_bus(config: &BusConfig) -> Result<Arc<RedisBus>> {
    let codec = crate::codec::init_codec(config.codec);
    let mut redis_config = RedisBusConfig::new(&config.url)
        .with_max_retries(config.max_retries)
        .with_mailbox_capacity(config.mailbox_capacity);
    if let Some(name) = &config.consumer_name {
        redis_config = redis_config.with_consumer_name(name);
    }

    let bus = match config.variant {
        BusVariant::Pubsub => RedisBus::pub_sub(redis_config, codec).await?,
        BusVariant::Stream => RedisBus::stream(redis_config, codec).await?,
    };

    info!(variant = ?config.variant, "message bus initialized");
    Ok(Arc::new(bus))
}
