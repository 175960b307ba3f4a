//! Event bus fanning confirmed detections and lifecycle signals out to
//! subscribers.
//!
//! Each subscriber owns a bounded lock-free queue
//! (`crossbeam::queue::ArrayQueue`). Publishing never blocks: when a
//! subscriber's queue is full the oldest unread event is overwritten and the
//! subscriber's missed counter grows. The next receive reports
//! [`RecvError::Lagged`] once and then resumes with the oldest retained event.
//! A slow subscriber only ever loses its own events.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::detection::ConfirmedDetection;

// =============================================================================
// Events
// =============================================================================

/// Everything that flows through the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BusEvent {
    Detection(ConfirmedDetection),
    Lifecycle(LifecycleEvent),
    /// Contributed by the terminal integration
    Terminal(TerminalPresence),
}

impl BusEvent {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Detection(_) => "detection",
            Self::Lifecycle(_) => "lifecycle",
            Self::Terminal(_) => "terminal",
        }
    }
}

/// Scheduler lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Started {
        path: PathBuf,
        offset: u64,
        backend: String,
    },
    /// The watched file was replaced; the old inode was drained first.
    Rotated { path: PathBuf },
    /// Consumed bytes were reclaimed by the truncator.
    Truncated { path: PathBuf, reclaimed_bytes: u64 },
    FileMissing { path: PathBuf },
    IoDegraded {
        path: PathBuf,
        error: String,
        attempt: u32,
        retry_in_ms: u64,
    },
    Recovered { path: PathBuf, attempts: u32 },
    Stopped { path: PathBuf, offset: u64 },
}

/// Whether the terminal application is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalPresence {
    pub running: bool,
    pub pid: Option<u32>,
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    /// Events were overwritten because this subscriber fell behind.
    #[error("subscriber lagged, {missed_count} events dropped")]
    Lagged { missed_count: u64 },
    /// The bus shut down and every queued event was delivered.
    #[error("event bus closed")]
    Closed,
}

// =============================================================================
// Metrics
// =============================================================================

/// Bus counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct EventBusMetrics {
    events_published: AtomicU64,
    events_delivered: AtomicU64,
    events_dropped_no_subscribers: AtomicU64,
    events_dropped_overflow: AtomicU64,
}

impl EventBusMetrics {
    #[must_use]
    pub fn snapshot(&self, active_subscribers: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_dropped_no_subscribers: self
                .events_dropped_no_subscribers
                .load(Ordering::Relaxed),
            events_dropped_overflow: self.events_dropped_overflow.load(Ordering::Relaxed),
            active_subscribers,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub events_published: u64,
    pub events_delivered: u64,
    pub events_dropped_no_subscribers: u64,
    pub events_dropped_overflow: u64,
    pub active_subscribers: usize,
}

// =============================================================================
// Bus
// =============================================================================

struct Slot {
    id: u64,
    queue: ArrayQueue<BusEvent>,
    /// Overwritten events not yet reported to the subscriber
    missed: AtomicU64,
    missed_total: AtomicU64,
    alive: AtomicBool,
    ready: Notify,
}

struct BusInner {
    capacity: usize,
    subscribers: Mutex<Vec<Arc<Slot>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    metrics: EventBusMetrics,
}

impl BusInner {
    fn remove(&self, id: u64) -> bool {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|slot| {
            if slot.id == id {
                slot.alive.store(false, Ordering::Release);
                false
            } else {
                true
            }
        });
        before != subscribers.len()
    }
}

/// Cheaply clonable handle to one bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.inner.capacity)
            .field("subscribers", &self.subscriber_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl EventBus {
    /// Create a bus whose subscribers each buffer up to `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity: capacity.max(1),
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                metrics: EventBusMetrics::default(),
            }),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver `event` to every live subscriber. Returns how many received it.
    pub fn publish(&self, event: BusEvent) -> usize {
        let metrics = &self.inner.metrics;
        metrics.events_published.fetch_add(1, Ordering::Relaxed);
        if self.is_closed() {
            metrics
                .events_dropped_no_subscribers
                .fetch_add(1, Ordering::Relaxed);
            return 0;
        }

        let subscribers: Vec<Arc<Slot>> = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if subscribers.is_empty() {
            metrics
                .events_dropped_no_subscribers
                .fetch_add(1, Ordering::Relaxed);
            trace!(event = event.name(), "no subscribers");
            return 0;
        }

        let mut delivered = 0;
        for slot in &subscribers {
            if !slot.alive.load(Ordering::Acquire) {
                continue;
            }
            if slot.queue.force_push(event.clone()).is_some() {
                slot.missed.fetch_add(1, Ordering::Relaxed);
                slot.missed_total.fetch_add(1, Ordering::Relaxed);
                metrics
                    .events_dropped_overflow
                    .fetch_add(1, Ordering::Relaxed);
                trace!(subscriber_id = slot.id, "subscriber queue full, oldest dropped");
            }
            slot.ready.notify_one();
            delivered += 1;
        }
        metrics
            .events_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Register a new subscriber. It sees only events published afterwards.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot {
            id,
            queue: ArrayQueue::new(self.inner.capacity),
            missed: AtomicU64::new(0),
            missed_total: AtomicU64::new(0),
            alive: AtomicBool::new(!self.is_closed()),
            ready: Notify::new(),
        });
        if !self.is_closed() {
            self.inner
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Arc::clone(&slot));
        }
        debug!(subscriber_id = id, "subscriber registered");
        Subscription {
            slot,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a subscriber. Equivalent to dropping the handle.
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// Stop accepting events. Subscribers drain what is queued and then
    /// receive [`RecvError::Closed`].
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let subscribers = std::mem::take(
            &mut *self
                .inner
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for slot in subscribers {
            slot.alive.store(false, Ordering::Release);
            slot.ready.notify_one();
        }
        debug!("event bus shut down");
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot(self.subscriber_count())
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Receiving end for one subscriber. Unsubscribes on drop.
pub struct Subscription {
    slot: Arc<Slot>,
    bus: Weak<BusInner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.slot.id)
            .field("queued", &self.slot.queue.len())
            .field("missed_total", &self.missed_total())
            .finish()
    }
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.slot.id
    }

    /// Events overwritten over this subscription's lifetime.
    #[must_use]
    pub fn missed_total(&self) -> u64 {
        self.slot.missed_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.slot.alive.load(Ordering::Acquire)
    }

    /// Take the next event without waiting.
    ///
    /// `Ok(None)` means nothing is queued right now.
    pub fn try_recv(&self) -> Result<Option<BusEvent>, RecvError> {
        let missed = self.slot.missed.swap(0, Ordering::AcqRel);
        if missed > 0 {
            warn!(subscriber_id = self.slot.id, missed, "subscriber lagged");
            return Err(RecvError::Lagged {
                missed_count: missed,
            });
        }
        match self.slot.queue.pop() {
            Some(event) => Ok(Some(event)),
            None if !self.is_alive() => Err(RecvError::Closed),
            None => Ok(None),
        }
    }

    /// Wait for the next event.
    pub async fn recv(&self) -> Result<BusEvent, RecvError> {
        loop {
            let notified = self.slot.ready.notified();
            if let Some(event) = self.try_recv()? {
                return Ok(event);
            }
            notified.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.slot.alive.store(false, Ordering::Release);
        if let Some(bus) = self.bus.upgrade() {
            if bus.remove(self.slot.id) {
                debug!(subscriber_id = self.slot.id, "subscriber removed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lifecycle(offset: u64) -> BusEvent {
        BusEvent::Lifecycle(LifecycleEvent::Stopped {
            path: PathBuf::from("/tmp/terminal.log"),
            offset,
        })
    }

    fn offset_of(event: &BusEvent) -> u64 {
        match event {
            BusEvent::Lifecycle(LifecycleEvent::Stopped { offset, .. }) => *offset,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_counts_drop() {
        let bus = EventBus::new(4);
        assert_eq!(bus.publish(lifecycle(0)), 0);
        let metrics = bus.metrics();
        assert_eq!(metrics.events_published, 1);
        assert_eq!(metrics.events_dropped_no_subscribers, 1);
    }

    #[test]
    fn every_subscriber_gets_every_event_in_order() {
        let bus = EventBus::new(8);
        let a = bus.subscribe();
        let b = bus.subscribe();
        for i in 0..3 {
            assert_eq!(bus.publish(lifecycle(i)), 2);
        }
        for sub in [&a, &b] {
            for i in 0..3 {
                assert_eq!(offset_of(&sub.try_recv().unwrap().unwrap()), i);
            }
            assert_eq!(sub.try_recv().unwrap(), None);
        }
    }

    #[test]
    fn overflow_drops_oldest_and_reports_lag_once() {
        let bus = EventBus::new(2);
        let sub = bus.subscribe();
        for i in 0..5 {
            bus.publish(lifecycle(i));
        }
        assert_eq!(sub.try_recv(), Err(RecvError::Lagged { missed_count: 3 }));
        assert_eq!(offset_of(&sub.try_recv().unwrap().unwrap()), 3);
        assert_eq!(offset_of(&sub.try_recv().unwrap().unwrap()), 4);
        assert_eq!(sub.try_recv().unwrap(), None);
        assert_eq!(sub.missed_total(), 3);
        assert_eq!(bus.metrics().events_dropped_overflow, 3);
    }

    #[test]
    fn slow_subscriber_does_not_affect_others() {
        let bus = EventBus::new(1);
        let slow = bus.subscribe();
        let fast = bus.subscribe();
        bus.publish(lifecycle(0));
        assert_eq!(offset_of(&fast.try_recv().unwrap().unwrap()), 0);
        bus.publish(lifecycle(1));
        assert_eq!(offset_of(&fast.try_recv().unwrap().unwrap()), 1);
        assert_eq!(fast.missed_total(), 0);
        assert!(matches!(slow.try_recv(), Err(RecvError::Lagged { missed_count: 1 })));
    }

    #[test]
    fn drop_unsubscribes() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        bus.unsubscribe(sub);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(lifecycle(0)), 0);
    }

    #[test]
    fn shutdown_drains_then_closes() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe();
        bus.publish(lifecycle(7));
        bus.shutdown();
        assert_eq!(bus.publish(lifecycle(8)), 0);
        assert_eq!(offset_of(&sub.try_recv().unwrap().unwrap()), 7);
        assert_eq!(sub.try_recv(), Err(RecvError::Closed));
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(lifecycle(3)).unwrap();
        assert_eq!(json["type"], "lifecycle");
        assert_eq!(json["data"]["event"], "stopped");
        assert_eq!(json["data"]["offset"], 3);

        let presence = BusEvent::Terminal(TerminalPresence {
            running: true,
            pid: Some(42),
        });
        let text = serde_json::to_string(&presence).unwrap();
        let back: BusEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back, presence);
    }

    #[tokio::test]
    async fn recv_wakes_on_publish() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe();
        let publisher = bus.clone();
        let handle = tokio::spawn(async move {
            tokio::task::yield_now().await;
            publisher.publish(lifecycle(9));
        });
        let event = sub.recv().await.unwrap();
        assert_eq!(offset_of(&event), 9);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn recv_returns_closed_after_shutdown() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe();
        bus.shutdown();
        assert_eq!(sub.recv().await, Err(RecvError::Closed));
    }
}
