//! One-shot reply promise.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::bus::BusError;
use crate::message::Message;

/// A one-shot promise for a reply-correlated message.
///
/// Settled exactly once with either the reply or an error. Clones share the
/// same slot: any number of observers may block on [`ReplyFuture::get`]
/// concurrently and all observe the settled value.
#[derive(Clone, Default)]
pub struct ReplyFuture {
    inner: Arc<FutureInner>,
}

#[derive(Default)]
struct FutureInner {
    slot: Mutex<Option<Result<Message, BusError>>>,
    notify: Notify,
}

impl ReplyFuture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settle the future. Returns `false` if it was already settled; the
    /// first settlement wins and later ones are dropped.
    pub fn settle(&self, result: Result<Message, BusError>) -> bool {
        {
            let mut slot = self.inner.slot.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
        }
        self.inner.notify.notify_waiters();
        true
    }

    pub fn is_settled(&self) -> bool {
        self.inner.slot.lock().is_some()
    }

    /// The settled value, if any, without blocking.
    pub fn try_get(&self) -> Option<Result<Message, BusError>> {
        self.inner.slot.lock().clone()
    }

    /// Block until the future settles.
    pub async fn wait(&self) -> Result<Message, BusError> {
        loop {
            // Register interest before checking the slot so a settle between
            // the check and the await is not missed.
            let notified = self.inner.notify.notified();
            if let Some(result) = self.try_get() {
                return result;
            }
            notified.await;
        }
    }

    /// Block until the future settles, at most `timeout`.
    ///
    /// An observer timing out does not settle the future; it only stops
    /// waiting.
    pub async fn get(&self, timeout: Duration) -> Result<Message, BusError> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(BusError::ReplyTimeout),
        }
    }

    /// Block until settled, discarding the value. Used for teardown paths
    /// that only care about completion.
    pub async fn settled(&self) {
        let _ = self.wait().await;
    }
}

impl fmt::Debug for ReplyFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyFuture")
            .field("settled", &self.is_settled())
            .finish()
    }
}
