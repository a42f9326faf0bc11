//! Event Bus (C11): topic-less publish/subscribe with typed events.
//! Delivery is ordered per subscriber; a slow subscriber only applies
//! backpressure to itself via a bounded per-subscriber queue (default 64)
//! with oldest-drop for most events — `StateChanged` and `ResetRequested`
//! are never dropped (§4.11).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::warn;

use crate::events::Event;

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct SubscriberStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of one subscriber's queue health, for the ambient watchdog/debug
/// surface — not used by any control-flow decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventBusStats {
    pub queued: usize,
    pub delivered: u64,
    pub dropped: u64,
}

struct Subscriber {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    stats: SubscriberStats,
    capacity: usize,
}

/// Handle returned by `EventBus::subscribe`. Dropping it unsubscribes on the
/// next publish (dead handles are pruned lazily).
pub struct Subscription {
    inner: Arc<Subscriber>,
}

impl Subscription {
    /// Waits for and returns the next event, in publish order.
    pub async fn recv(&self) -> Event {
        loop {
            if let Some(event) = self.inner.queue.lock().expect("bus queue poisoned").pop_front() {
                return event;
            }
            self.inner.notify.notified().await;
        }
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            queued: self.inner.queue.lock().expect("bus queue poisoned").len(),
            delivered: self.inner.stats.delivered.load(Ordering::Relaxed),
            dropped: self.inner.stats.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let inner = Arc::new(Subscriber {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            notify: Notify::new(),
            stats: SubscriberStats::default(),
            capacity,
        });
        self.subscribers.lock().expect("bus subscriber list poisoned").push(inner.clone());
        Subscription { inner }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("bus subscriber list poisoned").len()
    }

    /// Delivers `event` to every current subscriber. `StateChanged` and
    /// `ResetRequested` always land (the oldest queued entry is evicted to
    /// make room); every other event is dropped once a subscriber's queue is
    /// full, and the drop is counted rather than silently lost.
    pub fn publish(&self, event: Event) {
        let subscribers = self.subscribers.lock().expect("bus subscriber list poisoned");
        for sub in subscribers.iter() {
            let mut queue = sub.queue.lock().expect("bus queue poisoned");
            if queue.len() >= sub.capacity {
                if event.is_critical() {
                    queue.pop_front();
                } else {
                    sub.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(event = event.name(), "event bus subscriber queue full, dropping");
                    continue;
                }
            }
            queue.push_back(event.clone());
            sub.stats.delivered.fetch_add(1, Ordering::Relaxed);
            drop(queue);
            sub.notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_events_in_order() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        bus.publish(Event::InitComplete);
        bus.publish(Event::OwnerRegistered);
        assert_eq!(sub.recv().await.name(), "InitComplete");
        assert_eq!(sub.recv().await.name(), "OwnerRegistered");
    }

    #[tokio::test]
    async fn non_critical_events_drop_when_queue_full() {
        let bus = EventBus::new();
        let sub = bus.subscribe_with_capacity(2);
        bus.publish(Event::NetworkLost);
        bus.publish(Event::NetworkLost);
        bus.publish(Event::NetworkLost);
        assert_eq!(sub.stats().dropped, 1);
        assert_eq!(sub.stats().queued, 2);
    }

    #[tokio::test]
    async fn critical_events_evict_oldest_instead_of_dropping() {
        let bus = EventBus::new();
        let sub = bus.subscribe_with_capacity(1);
        bus.publish(Event::StateChanged {
            from: crate::state_machine::ProvisioningState::Initializing,
            to: crate::state_machine::ProvisioningState::Provisioning,
        });
        bus.publish(Event::ResetRequested);
        assert_eq!(sub.stats().dropped, 0);
        assert_eq!(sub.recv().await.name(), "ResetRequested");
    }

    #[tokio::test]
    async fn each_subscriber_gets_its_own_copy() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(Event::InitComplete);
        assert_eq!(a.recv().await.name(), "InitComplete");
        assert_eq!(b.recv().await.name(), "InitComplete");
    }
}
