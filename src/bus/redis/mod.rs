//! Redis message bus implementation.
//!
//! One adapter skeleton, two deployment shapes:
//! - **Pub/Sub** (`RedisBus::pub_sub`): one Redis channel per topic, every
//!   subscriber receives every message, no acknowledgement.
//! - **Stream** (`RedisBus::stream`): one stream per topic (key = canonical
//!   topic string), consumer groups map to `reply_group`, entries are acked
//!   after successful handler return; `"*"` broadcasts via a synthetic
//!   per-instance group.
//!
//! Inbound frames decode through the configured [`Codec`] and route by topic
//! to the matching [`Mailbox`], which fans out to the local handlers.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::mailbox::{Channel, Mailbox, OverflowPolicy};
use super::{Bus, BusError, BusHandle, HandlerError, MessageHandler, Result, Transport};
use crate::codec::Codec;
use crate::message::{is_broadcast_group, Message, ReplyFuture, Topic};
use crate::utils::retry::RetryConfig;

mod pubsub;
mod stream;

/// Field carrying the encoded envelope in a stream entry.
const BODY_FIELD: &str = "body";

/// Resolve the consumer group for a topic subscription. Broadcast selectors
/// get a synthetic per-instance group so every bus instance sees every
/// entry; named groups compete as-is.
fn resolve_group(group: &str) -> String {
    if is_broadcast_group(group) {
        format!("bcast-{}", Uuid::new_v4().simple())
    } else {
        group.to_string()
    }
}

/// Configuration for the Redis bus.
#[derive(Debug, Clone)]
pub struct RedisBusConfig {
    /// Redis connection URL (e.g. redis://localhost:6379).
    pub url: String,
    /// Stream consumer name within a group; generated when `None`.
    pub consumer_name: Option<String>,
    /// Consecutive reconnect attempts before a subscription is failed.
    pub max_retries: u32,
    /// Reconnect backoff shape.
    pub retry: RetryConfig,
    /// Per-mailbox bounded queue size.
    pub mailbox_capacity: usize,
    /// Behaviour of mailbox delivery on a full queue.
    pub overflow: OverflowPolicy,
    /// Idle interval after which pending stream entries are reclaimed from
    /// crashed consumers.
    pub pending_idle: Duration,
    /// Block interval for stream reads; bounds shutdown latency.
    pub poll_block: Duration,
    /// Grace period for in-flight handlers during `stop`.
    pub shutdown_timeout: Duration,
}

impl RedisBusConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = Some(name.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn with_pending_idle(mut self, idle: Duration) -> Self {
        self.pending_idle = idle;
        self
    }
}

impl Default for RedisBusConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            consumer_name: None,
            max_retries: 10,
            retry: RetryConfig::default(),
            mailbox_capacity: 1,
            overflow: OverflowPolicy::Error,
            pending_idle: Duration::from_secs(30),
            poll_block: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variant {
    PubSub,
    Stream,
}

struct TopicSlot {
    mailbox: Arc<Mailbox>,
    /// Consumer group for the stream variant; resolved at first subscribe.
    group: String,
    /// Whether a stream reader has been spawned for this topic.
    armed: bool,
}

struct BusCore {
    variant: Variant,
    config: RedisBusConfig,
    codec: Arc<dyn Codec>,
    client: Client,
    conn: ConnectionManager,
    consumer_name: String,
    mailboxes: Mutex<HashMap<Topic, TopicSlot>>,
    /// Fired when the topic set changes; the pubsub reader resubscribes.
    resync: Arc<Notify>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
}

impl BusCore {
    #[tracing::instrument(name = "bus.send", skip_all, fields(topic = %msg.topic))]
    async fn send(&self, msg: Message) -> Result<()> {
        if msg.topic.is_empty() {
            return Err(BusError::Publish("empty topic".to_string()));
        }
        let payload = self.codec.encode(&msg)?;
        let mut conn = self.conn.clone();
        match self.variant {
            Variant::PubSub => {
                let receivers: i64 = conn
                    .publish(msg.topic.as_str(), payload)
                    .await
                    .map_err(|e| BusError::Publish(e.to_string()))?;
                debug!(topic = %msg.topic, receivers, "published");
            }
            Variant::Stream => {
                let entry_id: String = conn
                    .xadd(msg.topic.as_str(), "*", &[(BODY_FIELD, payload.as_slice())])
                    .await
                    .map_err(|e| BusError::Publish(e.to_string()))?;
                debug!(topic = %msg.topic, entry_id = %entry_id, "appended to stream");
            }
        }
        Ok(())
    }

    /// Topics with at least one live subscriber.
    fn active_topics(&self) -> Vec<Topic> {
        self.mailboxes
            .lock()
            .iter()
            .filter(|(_, slot)| slot.mailbox.live_subscribers() > 0)
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    fn mailbox_for(&self, topic: &Topic) -> Option<Arc<Mailbox>> {
        self.mailboxes
            .lock()
            .get(topic)
            .map(|slot| slot.mailbox.clone())
    }

    /// Drop a topic whose last subscriber has closed; stops its mailbox.
    fn retire_mailbox(&self, topic: &Topic) {
        let removed = {
            let mut boxes = self.mailboxes.lock();
            match boxes.get(topic) {
                Some(slot) if slot.mailbox.live_subscribers() == 0 => boxes.remove(topic),
                _ => None,
            }
        };
        if let Some(slot) = removed {
            slot.mailbox.stop();
            debug!(topic = %topic, "mailbox retired");
        }
    }

    /// Record a terminal failure on every registered mailbox.
    fn fail_all(&self, err: &BusError) {
        let boxes = self.mailboxes.lock();
        for slot in boxes.values() {
            slot.mailbox.fail(err.clone());
        }
    }

    /// Route one decoded inbound message to its topic mailbox.
    async fn route(&self, msg: Message) {
        let Some(mailbox) = self.mailbox_for(&msg.topic) else {
            debug!(topic = %msg.topic, "no mailbox for inbound message");
            return;
        };
        if let Err(err) = mailbox.deliver(msg).await {
            error!(error = %err, "inbound delivery failed");
        }
    }
}

/// Redis-backed message bus. Cheap to clone; clones share the underlying
/// connection and subscriptions.
#[derive(Clone)]
pub struct RedisBus {
    core: Arc<BusCore>,
}

impl RedisBus {
    /// Create a bus over Redis Pub/Sub (broadcast, no acknowledgement).
    pub async fn pub_sub(config: RedisBusConfig, codec: Arc<dyn Codec>) -> Result<Self> {
        Self::connect(Variant::PubSub, config, codec).await
    }

    /// Create a bus over Redis Streams (competing consumers, per-entry
    /// acknowledgement).
    pub async fn stream(config: RedisBusConfig, codec: Arc<dyn Codec>) -> Result<Self> {
        Self::connect(Variant::Stream, config, codec).await
    }

    async fn connect(
        variant: Variant,
        config: RedisBusConfig,
        codec: Arc<dyn Codec>,
    ) -> Result<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| BusError::Connection(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BusError::Connection(format!("failed to connect: {e}")))?;

        let consumer_name = config
            .consumer_name
            .clone()
            .unwrap_or_else(|| format!("consumer-{}", Uuid::new_v4().simple()));

        info!(url = %config.url, variant = ?variant, "connected to Redis");

        let core = Arc::new(BusCore {
            variant,
            config,
            codec,
            client,
            conn,
            consumer_name,
            mailboxes: Mutex::new(HashMap::new()),
            resync: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            started: AtomicBool::new(false),
        });
        Ok(Self { core })
    }

    /// Spawn the reader loops and arm existing registrations. Idempotent.
    pub fn start(&self) {
        if self.core.started.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.core.variant {
            Variant::PubSub => {
                self.core.tracker.spawn(pubsub::run(self.clone()));
            }
            Variant::Stream => {
                let mut boxes = self.core.mailboxes.lock();
                for (topic, slot) in boxes.iter_mut() {
                    if !slot.armed {
                        slot.armed = true;
                        self.core.tracker.spawn(stream::run(
                            self.clone(),
                            topic.clone(),
                            slot.group.clone(),
                            slot.mailbox.clone(),
                        ));
                    }
                }
            }
        }
        info!(variant = ?self.core.variant, "redis bus started");
    }

    /// Cancel all workers, drain in-flight handlers up to the shutdown
    /// deadline, and release subscriptions. Idempotent.
    pub async fn stop(&self) {
        self.core.cancel.cancel();
        let mailboxes: Vec<Arc<Mailbox>> = {
            let mut boxes = self.core.mailboxes.lock();
            boxes.drain().map(|(_, slot)| slot.mailbox).collect()
        };
        for mailbox in &mailboxes {
            mailbox.stop();
        }
        self.core.tracker.close();
        let deadline = self.core.config.shutdown_timeout;
        if tokio::time::timeout(deadline, self.core.tracker.wait())
            .await
            .is_err()
        {
            warn!("shutdown deadline elapsed with workers still running");
        }
        for mailbox in mailboxes {
            let _ = tokio::time::timeout(deadline, mailbox.wait()).await;
        }
        info!("redis bus stopped");
    }

    /// Block until the ambient cancellation fires and every worker task has
    /// exited.
    pub async fn wait(&self) {
        self.core.cancel.cancelled().await;
        self.core.tracker.close();
        self.core.tracker.wait().await;
        let mailboxes: Vec<Arc<Mailbox>> = {
            let boxes = self.core.mailboxes.lock();
            boxes.values().map(|slot| slot.mailbox.clone()).collect()
        };
        for mailbox in mailboxes {
            mailbox.stop();
            mailbox.wait().await;
        }
    }

    /// Cancellation token governing this bus; cancel it to initiate
    /// shutdown from outside.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.core.cancel.clone()
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn send(&self, msg: Message) -> Result<()> {
        self.core.send(msg).await
    }

    async fn send_for_reply(
        &self,
        timeout: Duration,
        topic: Topic,
        group: &str,
        msg: Message,
    ) -> ReplyFuture {
        let future = ReplyFuture::new();

        let settle = future.clone();
        let handler: Arc<dyn MessageHandler> = Arc::new(
            move |reply: Message,
                  _bus: BusHandle|
                  -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
                let settle = settle.clone();
                Box::pin(async move {
                    settle.settle(Ok(reply));
                    Ok(())
                })
            },
        );

        let channel = self.listen(topic.reply_topic(), group, handler);
        if let Some(err) = channel.err() {
            future.settle(Err(err));
            return future;
        }

        if let Err(err) = self.core.send(msg).await {
            future.settle(Err(err));
            channel.close();
            return future;
        }

        let teardown = future.clone();
        let cancel = self.core.cancel.clone();
        self.core.tracker.spawn(async move {
            tokio::select! {
                _ = teardown.settled() => {}
                _ = cancel.cancelled() => {
                    teardown.settle(Err(BusError::Closed));
                }
                _ = tokio::time::sleep(timeout) => {
                    teardown.settle(Err(BusError::ReplyTimeout));
                }
            }
            channel.close();
        });

        future
    }
}

impl Transport for RedisBus {
    fn listen(&self, topic: Topic, group: &str, handler: Arc<dyn MessageHandler>) -> Channel {
        if topic.is_empty() {
            return Channel::dead(BusError::Subscribe("empty topic".to_string()));
        }
        if self.core.cancel.is_cancelled() {
            return Channel::dead(BusError::Closed);
        }

        let channel;
        {
            let mut boxes = self.core.mailboxes.lock();
            let slot = match boxes.entry(topic.clone()) {
                Entry::Occupied(occupied) => {
                    let slot = occupied.into_mut();
                    if self.core.variant == Variant::Stream
                        && !is_broadcast_group(group)
                        && slot.group != group
                    {
                        warn!(
                            topic = %topic,
                            requested = group,
                            active = %slot.group,
                            "topic already subscribed under a different group; keeping the active one"
                        );
                    }
                    slot
                }
                Entry::Vacant(vacant) => {
                    let mailbox = Arc::new(Mailbox::new(
                        topic.clone(),
                        self.core.config.mailbox_capacity,
                        self.core.config.overflow,
                        self.bus(),
                        self.core.cancel.clone(),
                        Some(self.core.resync.clone()),
                    ));
                    mailbox.start();
                    debug!(topic = %topic, "mailbox created");
                    vacant.insert(TopicSlot {
                        mailbox,
                        group: resolve_group(group),
                        armed: false,
                    })
                }
            };

            channel = slot.mailbox.add(handler);
            if self.core.variant == Variant::Stream
                && self.core.started.load(Ordering::SeqCst)
                && !slot.armed
            {
                slot.armed = true;
                self.core.tracker.spawn(stream::run(
                    self.clone(),
                    topic.clone(),
                    slot.group.clone(),
                    slot.mailbox.clone(),
                ));
            }
        }

        if self.core.variant == Variant::PubSub {
            self.core.resync.notify_one();
        }
        channel
    }

    fn bus(&self) -> BusHandle {
        BusHandle::new(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests;
