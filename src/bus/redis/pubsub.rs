//! Pub/Sub reader loop.
//!
//! One task owns the pubsub connection for the whole bus. Topic-set changes
//! (new listeners, closed channels) fire the resync signal; the reader
//! applies the delta between streams. A lost connection reconnects with the
//! configured backoff and resubscribes every active topic.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use redis::aio::PubSub;
use redis::Msg;
use tracing::{debug, error, info, warn};

use super::{BusCore, RedisBus};
use crate::bus::BusError;
use crate::message::Topic;

enum Event {
    Shutdown,
    Resync,
    Inbound(Msg),
    Disconnected,
}

pub(super) async fn run(bus: RedisBus) {
    let core = &bus.core;
    let retry = core.config.retry.retry_func();
    let mut backoff = Duration::ZERO;
    let mut failures: u32 = 0;

    'connect: loop {
        if core.cancel.is_cancelled() {
            return;
        }

        let mut pubsub = match core.client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(err) => {
                failures += 1;
                if failures > core.config.max_retries {
                    let err = BusError::Connection(err.to_string());
                    core.fail_all(&err);
                    error!(error = %err, attempts = failures, "pubsub connect failed; giving up");
                    return;
                }
                backoff = retry(backoff);
                warn!(
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    "pubsub connect failed; retrying"
                );
                tokio::select! {
                    _ = core.cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                continue;
            }
        };
        failures = 0;
        backoff = Duration::ZERO;

        let mut subscribed: HashSet<Topic> = HashSet::new();
        if sync_subscriptions(core, &mut pubsub, &mut subscribed)
            .await
            .is_err()
        {
            backoff = retry(backoff);
            tokio::select! {
                _ = core.cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            continue 'connect;
        }
        info!(topics = subscribed.len(), "pubsub consumer connected");

        loop {
            let event = {
                let mut messages = pubsub.on_message();
                tokio::select! {
                    biased;
                    _ = core.cancel.cancelled() => Event::Shutdown,
                    _ = core.resync.notified() => Event::Resync,
                    msg = messages.next() => match msg {
                        Some(msg) => Event::Inbound(msg),
                        None => Event::Disconnected,
                    },
                }
            };
            match event {
                Event::Shutdown => return,
                Event::Resync => {
                    if sync_subscriptions(core, &mut pubsub, &mut subscribed)
                        .await
                        .is_err()
                    {
                        backoff = retry(backoff);
                        tokio::select! {
                            _ = core.cancel.cancelled() => return,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        continue 'connect;
                    }
                }
                Event::Inbound(msg) => route(core, msg).await,
                Event::Disconnected => {
                    backoff = retry(backoff);
                    warn!(
                        backoff_ms = backoff.as_millis() as u64,
                        "pubsub connection lost; reconnecting"
                    );
                    tokio::select! {
                        _ = core.cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    continue 'connect;
                }
            }
        }
    }
}

/// Bring the broker subscription set in line with the live-topic set.
/// Topics whose last subscriber closed are unsubscribed and retired.
async fn sync_subscriptions(
    core: &Arc<BusCore>,
    pubsub: &mut PubSub,
    subscribed: &mut HashSet<Topic>,
) -> Result<(), ()> {
    let desired: HashSet<Topic> = core.active_topics().into_iter().collect();

    for topic in desired.difference(subscribed) {
        if let Err(err) = pubsub.subscribe(topic.as_str()).await {
            warn!(topic = %topic, error = %err, "subscribe failed; reconnecting");
            return Err(());
        }
        debug!(topic = %topic, "subscribed");
    }

    let stale: Vec<Topic> = subscribed.difference(&desired).cloned().collect();
    for topic in &stale {
        if let Err(err) = pubsub.unsubscribe(topic.as_str()).await {
            warn!(topic = %topic, error = %err, "unsubscribe failed; reconnecting");
            return Err(());
        }
        core.retire_mailbox(topic);
        debug!(topic = %topic, "unsubscribed");
    }

    *subscribed = desired;
    Ok(())
}

/// Decode an inbound frame and hand it to the topic mailbox. Malformed
/// frames are logged and dropped; the reader keeps consuming.
async fn route(core: &Arc<BusCore>, msg: Msg) {
    let topic = Topic::new(msg.get_channel_name());
    let payload: Vec<u8> = match msg.get_payload() {
        Ok(payload) => payload,
        Err(err) => {
            error!(topic = %topic, error = %err, "unreadable pubsub payload; dropped");
            return;
        }
    };
    match core.codec.decode(&payload) {
        Ok(decoded) => core.route(decoded).await,
        Err(err) => {
            error!(topic = %topic, error = %err, "failed to decode inbound frame; dropped");
        }
    }
}
