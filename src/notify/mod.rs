//! Notification Bus
//!
//! Topic-keyed publish/subscribe used to signal snapshot list changes,
//! receive progress, push completion and volume state transitions.
//! Delivery only reaches subscribers registered at publish time.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::volume::{Snapshot, Transition};

type Subscribers<T> = HashMap<String, HashMap<u64, mpsc::UnboundedSender<T>>>;

/// Fan-out of values to per-topic subscribers
pub struct Observer<T> {
    name: &'static str,
    subscribers: Arc<Mutex<Subscribers<T>>>,
    next_id: AtomicU64,
}

impl<T: Clone + Send + 'static> Observer<T> {
    /// Create a new observer
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Deliver a value to the current subscribers of `topic`.
    /// Returns the number of subscribers reached.
    pub fn publish(&self, topic: &str, value: T) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(topic_subs) = subscribers.get_mut(topic) else {
            return 0;
        };

        topic_subs.retain(|_, tx| tx.send(value.clone()).is_ok());
        let delivered = topic_subs.len();
        if topic_subs.is_empty() {
            subscribers.remove(topic);
        }

        tracing::trace!("{}: published on {} to {} subscribers", self.name, topic, delivered);
        delivered
    }

    /// Register a new subscriber for `topic`
    pub fn subscribe(&self, topic: &str) -> Subscription<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .insert(id, tx);

        Subscription {
            id,
            topic: topic.to_string(),
            rx: UnboundedReceiverStream::new(rx),
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    /// Number of live subscribers on a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}

/// A live subscription. Dropping it, or calling `unsubscribe`, removes it
/// from the observer.
pub struct Subscription<T> {
    id: u64,
    topic: String,
    rx: UnboundedReceiverStream<T>,
    subscribers: Arc<Mutex<Subscribers<T>>>,
}

impl<T> Subscription<T> {
    /// Wait for the next value
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.next().await
    }

    /// Take a value if one is already queued
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.as_mut().try_recv().ok()
    }

    /// Topic this subscription listens on
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Stop receiving values
    pub fn unsubscribe(self) {}

    fn detach(&self) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(topic_subs) = subscribers.get_mut(&self.topic) {
            topic_subs.remove(&self.id);
            if topic_subs.is_empty() {
                subscribers.remove(&self.topic);
            }
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.detach();
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

/// The node-wide set of observers, keyed by filesystem id
pub struct Bus {
    /// Snapshot list of a volume changed on this node
    pub new_snapshots: Observer<Vec<Snapshot>>,
    /// Bytes received so far by an inbound push
    pub receive_progress: Observer<u64>,
    /// An external push finished and its prelude was applied. Carries the
    /// receive id minted when the volume entered `receiving`.
    pub push_completed: Observer<Uuid>,
    /// A volume actor changed state
    pub transitions: Observer<Transition>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            new_snapshots: Observer::new("new-snapshots"),
            receive_progress: Observer::new("receive-progress"),
            push_completed: Observer::new("push-completed"),
            transitions: Observer::new("transitions"),
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}
