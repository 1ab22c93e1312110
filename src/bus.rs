//! In-process typed publish/subscribe hub.
//!
//! Each topic is backed by a broadcast ring sized by `capacity`; a slow
//! subscriber lags independently of the others, the oldest entries are
//! overwritten, and the number of skipped entries is accumulated per topic.
//! Publishing never blocks the producer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::events::{Event, Topic};

/// Default per-subscriber queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Central event bus. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    /// Topic -> broadcast channel
    channels: DashMap<Topic, broadcast::Sender<Event>>,
    /// Topic -> dropped-entry counter (overflow across all subscribers)
    overflow: DashMap<Topic, Arc<AtomicU64>>,
    capacity: usize,
    closed: AtomicBool,
    total_published: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                channels: DashMap::new(),
                overflow: DashMap::new(),
                capacity: capacity.max(1),
                closed: AtomicBool::new(false),
                total_published: AtomicU64::new(0),
            }),
        }
    }

    /// Publish an event to its topic. Returns the number of subscribers that
    /// will observe it. Never blocks; after [`EventBus::close`] this is a
    /// no-op returning 0.
    pub fn publish(&self, event: Event) -> usize {
        if self.inner.closed.load(Ordering::SeqCst) {
            trace!("bus closed, dropping {} event", event.topic());
            return 0;
        }

        let topic = event.topic();
        let notified = match self.inner.channels.get(&topic) {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        };

        self.inner.total_published.fetch_add(1, Ordering::Relaxed);
        trace!("published to '{}', notified {}", topic, notified);
        notified
    }

    /// Subscribe to a topic. Each subscription has an independent position in
    /// the topic's ring; dropping the returned handle unsubscribes, and
    /// dropping it twice is naturally idempotent.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let sender = self
            .inner
            .channels
            .entry(topic)
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .clone();
        let overflow = self
            .inner
            .overflow
            .entry(topic)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();

        debug!("new subscription to '{}'", topic);
        Subscription {
            topic,
            rx: sender.subscribe(),
            overflow,
        }
    }

    /// Stop accepting publishes. Already-queued events remain readable by
    /// subscribers.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        debug!("event bus closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> BusStats {
        let overflow = self
            .inner
            .overflow
            .iter()
            .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
            .collect();
        BusStats {
            total_published: self.inner.total_published.load(Ordering::Relaxed),
            topics: self.inner.channels.len(),
            overflow,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

/// One subscriber's position on one topic.
pub struct Subscription {
    topic: Topic,
    rx: broadcast::Receiver<Event>,
    overflow: Arc<AtomicU64>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Receive the next event, in publish order. Returns `None` once every
    /// publisher side of the topic is gone and the ring is drained. Entries
    /// this subscriber was too slow for are skipped and counted.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.overflow.fetch_add(skipped, Ordering::Relaxed);
                    debug!("subscriber lagged on '{}', skipped {}", self.topic, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive; `None` when nothing is pending.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    self.overflow.fetch_add(skipped, Ordering::Relaxed);
                }
                Err(_) => return None,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusStats {
    pub total_published: u64,
    pub topics: usize,
    pub overflow: HashMap<Topic, u64>,
}
