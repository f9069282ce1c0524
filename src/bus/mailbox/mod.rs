//! Per-topic bounded delivery queue with local fan-out.
//!
//! A [`Mailbox`] owns the subscriber list for one topic, a bounded inbound
//! queue, and a single consumer task that delivers each message to every
//! live handler in registration order. Handler invocation is sequential
//! within the mailbox: a slow handler stalls it, and that back-pressure
//! propagates to producers. Handlers wanting concurrency dispatch
//! internally.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, error};

use super::{BusError, BusHandle, MessageHandler, Result};
use crate::message::{Message, Topic};

/// Behaviour of `deliver` when the bounded queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Return [`BusError::MailboxFull`] immediately.
    #[default]
    Error,
    /// Block up to the given duration, then return
    /// [`BusError::MailboxFull`].
    BlockWithTimeout(Duration),
}

/// Result of pushing one message through the subscriber snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every handler returned Ok.
    Delivered,
    /// At least one handler failed; `retryable` is true if any failure was
    /// retryable.
    HandlerFailed { retryable: bool },
    /// No live subscribers at dispatch time.
    NoSubscribers,
}

impl DispatchOutcome {
    /// Whether the broker entry behind this message should be acknowledged.
    ///
    /// Fatal failures acknowledge: redelivering a message the handler
    /// classified as unprocessable only repeats the failure.
    pub fn should_ack(&self) -> bool {
        !matches!(self, Self::HandlerFailed { retryable: true })
    }
}

enum State {
    New(mpsc::Receiver<Envelope>),
    Running,
    Stopping,
    Stopped,
}

struct Envelope {
    msg: Message,
    receipt: Option<oneshot::Sender<DispatchOutcome>>,
}

struct Entry {
    id: u64,
    handler: Arc<dyn MessageHandler>,
    alive: bool,
}

struct MailboxInner {
    topic: Topic,
    state: Mutex<State>,
    subscribers: Mutex<Vec<Entry>>,
    live: AtomicUsize,
    next_id: AtomicU64,
    /// Terminal subscription failure, surfaced through `Channel::err`.
    failure: Mutex<Option<BusError>>,
    cancel: tokio_util::sync::CancellationToken,
    done: watch::Sender<bool>,
    /// Fired on subscriber-set changes so the owning adapter can resync its
    /// broker subscriptions.
    on_change: Option<Arc<Notify>>,
}

impl MailboxInner {
    fn is_accepting(&self) -> bool {
        matches!(*self.state.lock(), State::New(_) | State::Running)
    }

    /// Live handlers in registration order, compacting dead entries.
    fn snapshot(&self) -> Vec<(u64, Arc<dyn MessageHandler>)> {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|entry| entry.alive);
        subscribers
            .iter()
            .map(|entry| (entry.id, entry.handler.clone()))
            .collect()
    }

    fn mark_dead(&self, id: u64) {
        let mut subscribers = self.subscribers.lock();
        if let Some(entry) = subscribers.iter_mut().find(|e| e.id == id && e.alive) {
            entry.alive = false;
            drop(subscribers);
            self.live.fetch_sub(1, Ordering::SeqCst);
            debug!(topic = %self.topic, subscriber = id, "subscriber closed");
            if let Some(notify) = &self.on_change {
                notify.notify_one();
            }
        }
    }

    fn finish(&self) {
        eprintln!("DIAG: finish() entered");
        *self.state.lock() = State::Stopped;
        let released = {
            let mut subscribers = self.subscribers.lock();
            let count = subscribers.len();
            subscribers.clear();
            count
        };
        self.live.store(0, Ordering::SeqCst);
        let send_result = self.done.send(true);
        eprintln!("DIAG: done.send(true) result={:?}, receiver_count={}", send_result.is_ok(), self.done.receiver_count());
        debug!(topic = %self.topic, released, "mailbox consumer stopped");
        if let Some(notify) = &self.on_change {
            notify.notify_one();
        }
    }
}

/// Per-topic named queue with one consumer task.
///
/// Lifecycle: `New -> Running -> Stopping -> Stopped`. `deliver` buffers up
/// to capacity before `start`; after `stop` (or cancellation of the ambient
/// token) it returns [`BusError::Closed`]. `start` and `stop` are
/// idempotent.
pub struct Mailbox {
    inner: Arc<MailboxInner>,
    tx: mpsc::Sender<Envelope>,
    bus: BusHandle,
    overflow: OverflowPolicy,
}

impl Mailbox {
    /// Create a mailbox for `topic` with the given queue capacity.
    ///
    /// `bus` is handed to every handler invocation; `cancel` is the ambient
    /// cancellation token (the mailbox derives a child from it);
    /// `on_change` fires whenever the subscriber set shrinks or the mailbox
    /// stops.
    pub fn new(
        topic: Topic,
        capacity: usize,
        overflow: OverflowPolicy,
        bus: BusHandle,
        cancel: tokio_util::sync::CancellationToken,
        on_change: Option<Arc<Notify>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (done, _) = watch::channel(false);
        let inner = Arc::new(MailboxInner {
            topic,
            state: Mutex::new(State::New(rx)),
            subscribers: Mutex::new(Vec::new()),
            live: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            failure: Mutex::new(None),
            cancel: cancel.child_token(),
            done,
            on_change,
        });
        Self {
            inner,
            tx,
            bus,
            overflow,
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.inner.topic
    }

    /// Number of live subscribers.
    pub fn live_subscribers(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Launch the consumer task. Idempotent; a no-op once stopped.
    pub fn start(&self) {
        let mut state = self.inner.state.lock();
        let prev = std::mem::replace(&mut *state, State::Running);
        match prev {
            State::New(rx) => {
                drop(state);
                self.spawn_consumer(rx);
                debug!(topic = %self.inner.topic, "mailbox started");
            }
            other => *state = other,
        }
    }

    /// Signal the consumer to stop. Idempotent. The in-flight message
    /// completes; queued messages are released unprocessed.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        eprintln!("DIAG: stop() entered, state={}", match *state { State::New(_) => "New", State::Running => "Running", State::Stopping => "Stopping", State::Stopped => "Stopped" });
        match *state {
            State::New(_) => {
                // Never started: release the queue and finish directly.
                *state = State::Stopped;
                drop(state);
                eprintln!("DIAG: stop() calling finish()");
                self.inner.finish();
            }
            State::Running => {
                *state = State::Stopping;
                drop(state);
                self.inner.cancel.cancel();
            }
            State::Stopping | State::Stopped => {}
        }
    }

    /// Block until the consumer task has exited, via `stop` or cancellation
    /// of the ambient token.
    pub async fn wait(&self) {
        let mut done = self.inner.done.subscribe();
        eprintln!("DIAG: wait subscribed, current={}", *done.borrow());
        while !*done.borrow_and_update() {
            eprintln!("DIAG: wait looping, awaiting changed()");
            if done.changed().await.is_err() {
                break;
            }
        }
        eprintln!("DIAG: wait done");
    }

    /// Register a handler; returns a fresh [`Channel`] owning the
    /// registration. Safe before or after `start`. The handler observes only
    /// messages enqueued after this call returns.
    pub fn add(&self, handler: Arc<dyn MessageHandler>) -> Channel {
        if !self.inner.is_accepting() {
            return Channel::dead(BusError::Closed);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribers.lock().push(Entry {
            id,
            handler,
            alive: true,
        });
        self.inner.live.fetch_add(1, Ordering::SeqCst);
        debug!(topic = %self.inner.topic, subscriber = id, "subscriber added");
        Channel::live(id, Arc::downgrade(&self.inner))
    }

    /// Enqueue a message for fan-out.
    ///
    /// When the bounded queue is full the behaviour follows the
    /// [`OverflowPolicy`] given at construction; saturation is always
    /// surfaced to the caller, never silently dropped. On a stopping or
    /// stopped mailbox returns [`BusError::Closed`].
    pub async fn deliver(&self, msg: Message) -> Result<()> {
        self.push(Envelope { msg, receipt: None }).await
    }

    /// Enqueue a message and obtain a receipt settled with the
    /// [`DispatchOutcome`] once every handler has run. Used by acknowledging
    /// transports.
    pub async fn deliver_tracked(&self, msg: Message) -> Result<oneshot::Receiver<DispatchOutcome>> {
        let (tx, rx) = oneshot::channel();
        self.push(Envelope {
            msg,
            receipt: Some(tx),
        })
        .await?;
        Ok(rx)
    }

    /// Record a terminal subscription failure, observable through
    /// `Channel::err` of every subscriber.
    pub fn fail(&self, err: BusError) {
        let mut failure = self.inner.failure.lock();
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    async fn push(&self, envelope: Envelope) -> Result<()> {
        if !self.inner.is_accepting() {
            return Err(BusError::Closed);
        }
        match self.overflow {
            OverflowPolicy::Error => self.tx.try_send(envelope).map_err(|e| match e {
                TrySendError::Full(_) => BusError::MailboxFull {
                    topic: self.inner.topic.clone(),
                },
                TrySendError::Closed(_) => BusError::Closed,
            }),
            OverflowPolicy::BlockWithTimeout(timeout) => self
                .tx
                .send_timeout(envelope, timeout)
                .await
                .map_err(|e| match e {
                    SendTimeoutError::Timeout(_) => BusError::MailboxFull {
                        topic: self.inner.topic.clone(),
                    },
                    SendTimeoutError::Closed(_) => BusError::Closed,
                }),
        }
    }

    fn spawn_consumer(&self, mut rx: mpsc::Receiver<Envelope>) {
        let inner = self.inner.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            debug!(topic = %inner.topic, "mailbox consumer started");
            loop {
                let envelope = tokio::select! {
                    biased;
                    _ = inner.cancel.cancelled() => None,
                    item = rx.recv() => item,
                };
                let Some(envelope) = envelope else { break };

                let snapshot = inner.snapshot();
                let outcome = dispatch(&inner.topic, envelope.msg, &snapshot, &bus).await;
                if let Some(receipt) = envelope.receipt {
                    let _ = receipt.send(outcome);
                }
            }
            // Release whatever is still queued; tracked receipts resolve as
            // cancelled on the sender drop.
            rx.close();
            while rx.try_recv().is_ok() {}
            inner.finish();
        });
    }
}

/// Deliver one message to each live handler in registration order.
async fn dispatch(
    topic: &Topic,
    msg: Message,
    snapshot: &[(u64, Arc<dyn MessageHandler>)],
    bus: &BusHandle,
) -> DispatchOutcome {
    if snapshot.is_empty() {
        return DispatchOutcome::NoSubscribers;
    }
    let mut failed = false;
    let mut retryable = false;
    for (id, handler) in snapshot {
        if let Err(err) = handler.handle(msg.clone(), bus.clone()).await {
            failed = true;
            retryable |= err.is_retryable();
            error!(topic = %topic, subscriber = *id, error = %err, "handler failed");
        }
    }
    if failed {
        DispatchOutcome::HandlerFailed { retryable }
    } else {
        DispatchOutcome::Delivered
    }
}

/// Opaque handle for one live subscription.
///
/// Holds a weak back-reference into the mailbox by subscriber id; the
/// mailbox remains the sole owner of the registration. `close` marks the
/// entry dead; the list compacts on the next snapshot, so a close during an
/// in-flight delivery does not cancel that delivery but prevents further
/// ones.
pub struct Channel {
    id: u64,
    mailbox: Weak<MailboxInner>,
    err: Option<BusError>,
}

impl Channel {
    fn live(id: u64, mailbox: Weak<MailboxInner>) -> Self {
        Self {
            id,
            mailbox,
            err: None,
        }
    }

    /// A channel that failed at subscribe time; dead on arrival.
    pub(crate) fn dead(err: BusError) -> Self {
        Self {
            id: 0,
            mailbox: Weak::new(),
            err: Some(err),
        }
    }

    /// Terminal error: a subscribe-time rejection, or a later fatal
    /// subscription failure recorded by the transport.
    pub fn err(&self) -> Option<BusError> {
        if let Some(err) = &self.err {
            return Some(err.clone());
        }
        self.mailbox
            .upgrade()
            .and_then(|inner| inner.failure.lock().clone())
    }

    /// Drop the registration. Idempotent; deliveries already in flight
    /// complete.
    pub fn close(&self) {
        if let Some(inner) = self.mailbox.upgrade() {
            inner.mark_dead(self.id);
        }
    }

    /// Whether the registration is still live.
    pub fn is_live(&self) -> bool {
        match self.mailbox.upgrade() {
            Some(inner) => inner
                .subscribers
                .lock()
                .iter()
                .any(|e| e.id == self.id && e.alive),
            None => false,
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("err", &self.err)
            .finish()
    }
}

#[cfg(test)]
mod tests;
