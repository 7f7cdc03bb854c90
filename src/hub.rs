//! Change hub: fans committed write batches out to live subscriptions.
//!
//! Each subscriber owns a bounded channel. Publishing never blocks the
//! writer: a subscriber whose buffer is full is failed and removed, and
//! its [`Subscription`] reports the failure on the next read.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::store::KeyValue;

type FailureSlot = Arc<Mutex<Option<String>>>;

struct Subscriber {
    prefixes: Vec<Vec<u8>>,
    sender: mpsc::Sender<Vec<KeyValue>>,
    failure: FailureSlot,
}

impl Subscriber {
    fn matches(&self, key: &[u8]) -> bool {
        self.prefixes.iter().any(|prefix| key.starts_with(prefix))
    }
}

#[derive(Default)]
struct HubState {
    subscribers: HashMap<u64, Subscriber>,
    closed: Option<String>,
}

struct HubInner {
    buffer: usize,
    next_id: AtomicU64,
    state: Mutex<HubState>,
}

/// Registry of live subscribers for one store.
#[derive(Clone)]
pub struct ChangeHub {
    inner: Arc<HubInner>,
}

impl ChangeHub {
    /// Creates a hub whose subscribers buffer up to `buffer` batches.
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                buffer: buffer.max(1),
                next_id: AtomicU64::new(1),
                state: Mutex::new(HubState::default()),
            }),
        }
    }

    /// Registers a subscriber for `prefixes`.
    ///
    /// Batches published after this returns are delivered to the new
    /// subscription. Fails once the hub has been closed.
    pub fn register(&self, prefixes: Vec<Vec<u8>>) -> Result<Subscription> {
        let mut state = self.inner.state.lock();
        if let Some(reason) = &state.closed {
            return Err(Error::Feed(reason.clone()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.inner.buffer);
        let failure = FailureSlot::default();
        state.subscribers.insert(
            id,
            Subscriber {
                prefixes: prefixes.clone(),
                sender,
                failure: Arc::clone(&failure),
            },
        );
        drop(state);

        metrics::subscription_opened();
        debug!(subscription = id, prefixes = prefixes.len(), "Subscriber registered");

        Ok(Subscription {
            id,
            prefixes,
            snapshot: VecDeque::new(),
            receiver,
            failure,
            hub: Arc::downgrade(&self.inner),
        })
    }

    /// Delivers the entries of a committed batch to every matching subscriber.
    ///
    /// Each subscriber receives only the entries under its prefixes, in batch
    /// order. Subscribers that see nothing are not notified.
    pub fn publish(&self, batch: &[KeyValue]) {
        let buffer = self.inner.buffer;
        let mut state = self.inner.state.lock();
        if state.subscribers.is_empty() {
            return;
        }

        state.subscribers.retain(|id, subscriber| {
            let matched: Vec<KeyValue> = batch
                .iter()
                .filter(|entry| subscriber.matches(&entry.key))
                .cloned()
                .collect();
            if matched.is_empty() {
                return !subscriber.sender.is_closed();
            }

            match subscriber.sender.try_send(matched) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(subscription = id, buffer, "Subscriber fell behind, dropping it");
                    *subscriber.failure.lock() =
                        Some(format!("subscriber fell behind by more than {buffer} batches"));
                    metrics::record_feed_failure("lagging");
                    false
                },
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Fails every live subscription with `reason` and refuses new ones.
    pub fn close(&self, reason: &str) {
        let mut state = self.inner.state.lock();
        if state.closed.is_some() {
            return;
        }
        state.closed = Some(reason.to_string());
        for (_, subscriber) in state.subscribers.drain() {
            *subscriber.failure.lock() = Some(reason.to_string());
        }
        debug!(reason, "Change hub closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed.is_some()
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }
}

impl std::fmt::Debug for ChangeHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeHub")
            .field("buffer", &self.inner.buffer)
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

/// A live subscription: the snapshot batches first, then every later
/// committed batch that touches the subscribed prefixes.
///
/// Dropping the subscription deregisters it.
pub struct Subscription {
    id: u64,
    prefixes: Vec<Vec<u8>>,
    snapshot: VecDeque<Vec<KeyValue>>,
    receiver: mpsc::Receiver<Vec<KeyValue>>,
    failure: FailureSlot,
    hub: Weak<HubInner>,
}

impl Subscription {
    /// Queues the initial snapshot ahead of the live feed.
    pub(crate) fn with_snapshot(mut self, batches: Vec<Vec<KeyValue>>) -> Self {
        self.snapshot.extend(batches.into_iter().filter(|batch| !batch.is_empty()));
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The normalized prefixes this subscription matches.
    pub fn prefixes(&self) -> &[Vec<u8>] {
        &self.prefixes
    }

    /// Waits for the next batch.
    ///
    /// Snapshot batches are returned before any live batch. Once the feed
    /// breaks every call returns [`Error::Feed`].
    pub async fn next(&mut self) -> Result<Vec<KeyValue>> {
        if let Some(batch) = self.snapshot.pop_front() {
            return Ok(batch);
        }
        match self.receiver.recv().await {
            Some(batch) => Ok(batch),
            None => Err(self.feed_error()),
        }
    }

    /// Returns the next batch if one is ready without waiting.
    pub fn try_next(&mut self) -> Result<Option<Vec<KeyValue>>> {
        if let Some(batch) = self.snapshot.pop_front() {
            return Ok(Some(batch));
        }
        match self.receiver.try_recv() {
            Ok(batch) => Ok(Some(batch)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(self.feed_error()),
        }
    }

    /// Converts into a stream that ends after yielding the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<KeyValue>>> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let mut subscription = state?;
            match subscription.next().await {
                Ok(batch) => Some((Ok(batch), Some(subscription))),
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    fn feed_error(&self) -> Error {
        let reason = self.failure.lock().clone();
        Error::Feed(reason.unwrap_or_else(|| "change feed closed".to_string()))
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("prefixes", &self.prefixes.len())
            .field("pending_snapshot", &self.snapshot.len())
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.state.lock().subscribers.remove(&self.id);
        }
        metrics::subscription_closed();
        debug!(subscription = self.id, "Subscriber deregistered");
    }
}
