//! Stream reader loop: one task per subscribed topic.
//!
//! Reads the topic's stream through its consumer group, delivers each entry
//! through the mailbox, and acknowledges after the handlers return. A
//! retryable handler failure leaves the entry pending; entries idle past
//! the configured interval are reclaimed from crashed consumers with
//! `XAUTOCLAIM`.

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, RedisResult, Value};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{BusCore, RedisBus, BODY_FIELD};
use crate::bus::mailbox::Mailbox;
use crate::bus::BusError;
use crate::message::Topic;

/// Entries fetched per read.
const READ_BATCH: usize = 16;

pub(super) async fn run(bus: RedisBus, topic: Topic, group: String, mailbox: Arc<Mailbox>) {
    let core = &bus.core;
    // Blocking reads need a connection of their own; sharing the bus-wide
    // multiplexed connection would stall every other command behind XREAD.
    let mut conn = match core.client.get_connection_manager().await {
        Ok(conn) => conn,
        Err(err) => {
            let err = BusError::Connection(err.to_string());
            mailbox.fail(err.clone());
            error!(stream = %topic, error = %err, "failed to open stream connection");
            return;
        }
    };
    let retry = core.config.retry.retry_func();
    let mut backoff = Duration::ZERO;
    let mut failures: u32 = 0;

    if !ensure_group(core, &mut conn, &topic, &group).await {
        return;
    }

    info!(
        stream = %topic,
        group = %group,
        consumer = %core.consumer_name,
        "stream consumer started"
    );

    let mut last_claim = Instant::now();
    loop {
        if core.cancel.is_cancelled() {
            return;
        }
        if mailbox.live_subscribers() == 0 {
            core.retire_mailbox(&topic);
            info!(stream = %topic, "last subscriber closed; stream consumer exiting");
            return;
        }

        if last_claim.elapsed() >= core.config.pending_idle {
            claim_pending(core, &mut conn, &topic, &group, &mailbox).await;
            last_claim = Instant::now();
        }

        let options = StreamReadOptions::default()
            .group(&group, &core.consumer_name)
            .count(READ_BATCH)
            .block(core.config.poll_block.as_millis() as usize);
        let topic_keys = [topic.as_str()];
        let read: RedisResult<StreamReadReply> = tokio::select! {
            _ = core.cancel.cancelled() => return,
            read = conn.xread_options(&topic_keys, &[">"], &options) => read,
        };

        match read {
            Ok(reply) => {
                failures = 0;
                backoff = Duration::ZERO;
                for key in reply.keys {
                    for entry in key.ids {
                        process_entry(core, &mut conn, &topic, &group, &mailbox, entry).await;
                    }
                }
            }
            Err(err) => {
                failures += 1;
                if failures > core.config.max_retries {
                    let err = BusError::Connection(err.to_string());
                    mailbox.fail(err.clone());
                    error!(
                        stream = %topic,
                        error = %err,
                        attempts = failures,
                        "stream read failed; giving up"
                    );
                    return;
                }
                backoff = retry(backoff);
                warn!(
                    stream = %topic,
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    "stream read failed; retrying"
                );
                tokio::select! {
                    _ = core.cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}

/// Create the consumer group at the stream tail, creating the stream if
/// needed. An already-existing group is fine.
async fn ensure_group(
    core: &Arc<BusCore>,
    conn: &mut ConnectionManager,
    topic: &Topic,
    group: &str,
) -> bool {
    let retry = core.config.retry.retry_func();
    let mut backoff = Duration::ZERO;
    let mut failures: u32 = 0;
    loop {
        let created: RedisResult<String> = conn
            .xgroup_create_mkstream(topic.as_str(), group, "$")
            .await;
        match created {
            Ok(_) => return true,
            Err(err) if err.to_string().contains("BUSYGROUP") => return true,
            Err(err) => {
                failures += 1;
                if failures > core.config.max_retries {
                    let err = BusError::Subscribe(format!("group create failed: {err}"));
                    core.fail_all(&err);
                    error!(stream = %topic, group = group, error = %err, "giving up");
                    return false;
                }
                backoff = retry(backoff);
                warn!(
                    stream = %topic,
                    group = group,
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    "group create failed; retrying"
                );
                tokio::select! {
                    _ = core.cancel.cancelled() => return false,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}

/// Reclaim entries another consumer read but never acknowledged.
async fn claim_pending(
    core: &Arc<BusCore>,
    conn: &mut ConnectionManager,
    topic: &Topic,
    group: &str,
    mailbox: &Arc<Mailbox>,
) {
    let min_idle = core.config.pending_idle.as_millis() as usize;
    let options = StreamAutoClaimOptions::default().count(READ_BATCH);
    let claimed: RedisResult<StreamAutoClaimReply> = conn
        .xautoclaim_options(
            topic.as_str(),
            group,
            &core.consumer_name,
            min_idle,
            "0-0",
            options,
        )
        .await;
    match claimed {
        Ok(reply) => {
            if !reply.claimed.is_empty() {
                debug!(
                    stream = %topic,
                    entries = reply.claimed.len(),
                    "reclaimed pending entries"
                );
            }
            for entry in reply.claimed {
                process_entry(core, conn, topic, group, mailbox, entry).await;
            }
        }
        Err(err) => {
            warn!(stream = %topic, error = %err, "pending reclaim failed");
        }
    }
}

/// Decode one entry, deliver it through the mailbox, and acknowledge based
/// on the dispatch outcome. Malformed entries are acked so the cursor
/// advances.
async fn process_entry(
    core: &Arc<BusCore>,
    conn: &mut ConnectionManager,
    topic: &Topic,
    group: &str,
    mailbox: &Arc<Mailbox>,
    entry: StreamId,
) {
    let Some(payload) = entry_body(&entry) else {
        warn!(stream = %topic, entry_id = %entry.id, "entry missing body field; acknowledged");
        ack(conn, topic, group, &entry.id).await;
        return;
    };

    let mut msg = match core.codec.decode(&payload) {
        Ok(msg) => msg,
        Err(err) => {
            error!(
                stream = %topic,
                entry_id = %entry.id,
                error = %err,
                "failed to decode entry; acknowledged"
            );
            ack(conn, topic, group, &entry.id).await;
            return;
        }
    };
    msg.delivery_mark = Some(entry.id.clone());

    match mailbox.deliver_tracked(msg).await {
        Err(err) => {
            // Left pending: redelivered once the mailbox has room again or
            // another consumer claims it.
            warn!(stream = %topic, entry_id = %entry.id, error = %err, "delivery rejected");
        }
        Ok(receipt) => match receipt.await {
            Ok(outcome) if outcome.should_ack() => {
                ack(conn, topic, group, &entry.id).await;
            }
            Ok(_) => {
                warn!(
                    stream = %topic,
                    entry_id = %entry.id,
                    "retryable handler failure; entry left pending"
                );
            }
            Err(_) => {
                debug!(stream = %topic, entry_id = %entry.id, "mailbox stopped mid-delivery");
            }
        },
    }
}

async fn ack(conn: &mut ConnectionManager, topic: &Topic, group: &str, entry_id: &str) {
    let acked: RedisResult<i64> = conn.xack(topic.as_str(), group, &[entry_id]).await;
    if let Err(err) = acked {
        warn!(stream = %topic, entry_id = entry_id, error = %err, "ack failed");
    }
}

fn entry_body(entry: &StreamId) -> Option<Vec<u8>> {
    match entry.map.get(BODY_FIELD) {
        Some(Value::BulkString(bytes)) => Some(bytes.clone()),
        _ => None,
    }
}
