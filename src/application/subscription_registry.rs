// Subscription registry - topic fan-out over the shared connection
use crate::domain::envelope::{Envelope, Topic};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

struct Subscriber {
    id: SubscriptionId,
    queue: mpsc::UnboundedSender<Arc<Envelope>>,
    worker: Option<JoinHandle<()>>,
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        // No callback may run once a subscriber is removed.
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

/// Fans envelopes out to every subscriber of their topic.
///
/// Each subscriber owns a FIFO queue drained independently, so delivery order
/// per topic matches arrival order and a slow or failing subscriber never
/// holds back the others. `dispatch` itself never suspends.
#[derive(Default)]
pub struct SubscriptionRegistry {
    topics: RwLock<HashMap<Topic, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for `topic`. Must be called inside a Tokio runtime.
    ///
    /// An error returned by the callback, or a panic inside it, is logged and
    /// the subscriber stays registered for later envelopes.
    pub fn subscribe<F>(&self, topic: Topic, mut callback: F) -> SubscriptionId
    where
        F: FnMut(&Envelope) -> anyhow::Result<()> + Send + 'static,
    {
        let id = self.next_id();
        let (queue, mut rx) = mpsc::unbounded_channel::<Arc<Envelope>>();

        let worker = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                match panic::catch_unwind(AssertUnwindSafe(|| callback(&envelope))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(subscription = %id, %topic, "subscriber failed: {:#}", e);
                    }
                    Err(_) => {
                        tracing::error!(subscription = %id, %topic, "subscriber panicked");
                    }
                }
            }
        });

        self.insert(topic, Subscriber { id, queue, worker: Some(worker) });
        id
    }

    /// Register a queue-backed subscriber and hand its receiving end to the caller.
    pub fn subscribe_channel(
        &self,
        topic: Topic,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<Arc<Envelope>>) {
        let id = self.next_id();
        let (queue, rx) = mpsc::unbounded_channel();
        self.insert(topic, Subscriber { id, queue, worker: None });
        (id, rx)
    }

    /// Remove exactly one subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut topics = self.write();
        let mut removed = false;
        for subscribers in topics.values_mut() {
            let before = subscribers.len();
            subscribers.retain(|s| s.id != id);
            removed |= subscribers.len() != before;
        }
        topics.retain(|_, subscribers| !subscribers.is_empty());
        removed
    }

    /// Remove every subscriber of `topic`, returning how many were dropped.
    pub fn unsubscribe_topic(&self, topic: Topic) -> usize {
        self.write().remove(&topic).map(|s| s.len()).unwrap_or(0)
    }

    /// Drop every registration.
    pub fn clear(&self) {
        let dropped: usize = self.write().drain().map(|(_, s)| s.len()).sum();
        if dropped > 0 {
            tracing::debug!("Dropped {} subscriptions", dropped);
        }
    }

    /// Queue `envelope` for every current subscriber of its topic.
    /// Returns the number of subscribers it was queued for.
    pub fn dispatch(&self, envelope: Arc<Envelope>) -> usize {
        let topic = envelope.topic();
        let topics = self.read();
        let Some(subscribers) = topics.get(&topic) else {
            return 0;
        };

        subscribers
            .iter()
            .filter(|s| s.queue.send(Arc::clone(&envelope)).is_ok())
            .count()
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.read().get(&topic).map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn insert(&self, topic: Topic, subscriber: Subscriber) {
        tracing::debug!(subscription = %subscriber.id, %topic, "Subscribed");
        self.write().entry(topic).or_default().push(subscriber);
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Topic, Vec<Subscriber>>> {
        self.topics.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Topic, Vec<Subscriber>>> {
        self.topics.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
