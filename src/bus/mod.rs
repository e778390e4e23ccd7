//! Event Bus (component A) — bounded pub/sub fan-out for everything that
//! happens inside the server: transcript file changes, session status
//! transitions, process state transitions, live messages, stream partials,
//! permission mode changes, worker activity, backend reloads, heartbeats.
//!
//! Grounded on `ProxyState::send_event()`'s fan-out-to-every-registered-
//! channel-under-one-lock idiom and on `adlio-mixtape`'s
//! `agui-handler.rs` bounded-channel-with-drop-on-full idiom. Subscribers
//! never block a publisher: a full subscriber queue drops its oldest entry
//! and counts the drop rather than back-pressuring the whole bus.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

use crate::model::{PermissionMode, ProcessState, SessionStatus};

/// Default bound for a single subscriber's event queue before drop-oldest
/// kicks in. Kept small: a slow consumer should see "you missed events",
/// never accumulate unbounded memory.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    FileChange {
        project_id: String,
        session_id: String,
    },
    SessionStatusChanged {
        session_id: String,
        status: SessionStatus,
    },
    ProcessStateChanged {
        process_id: String,
        session_id: String,
        state: ProcessState,
    },
    Message {
        session_id: String,
        message_id: String,
    },
    StreamPartial {
        session_id: String,
        delta: String,
    },
    ModeChanged {
        session_id: String,
        mode: PermissionMode,
        mode_version: u64,
    },
    WorkerActivity {
        process_id: String,
        active: bool,
    },
    BackendReloaded,
    Heartbeat,
}

/// A single subscriber's mailbox: a bounded ring buffer guarded by the same
/// lock a publisher takes to push into it, plus a dropped-event counter the
/// subscriber can surface to its client. A plain `mpsc` channel can only
/// drop the *incoming* event once full; reaching into the queue to evict the
/// *oldest* one instead (per spec.md §4.A) needs a buffer the publisher can
/// pop from directly, hence the hand-rolled deque instead of `mpsc`.
struct Subscriber {
    buf: VecDeque<Event>,
    capacity: usize,
    notify: Arc<Notify>,
    dropped: Arc<AtomicU64>,
}

/// Handle returned to a subscriber: a read-only view of how many events have
/// been dropped for slowness, plus `recv()` to drain the shared mailbox.
pub struct Subscription {
    id: u64,
    bus: EventBus,
    notify: Arc<Notify>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Await the next event, or `None` once this subscription has been
    /// cancelled. Waits on `notify` between empty-queue checks so a
    /// publisher's `publish()` wakes exactly the subscribers it delivered to.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            {
                let mut inner = self.bus.inner.lock().await;
                let Some(sub) = inner.subscribers.get_mut(&self.id) else {
                    return None;
                };
                if let Some(event) = sub.buf.pop_front() {
                    return Some(event);
                }
            }
            self.notify.notified().await;
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Inner>>,
    capacity: usize,
}

struct Inner {
    next_id: u64,
    subscribers: HashMap<u64, Subscriber>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                subscribers: HashMap::new(),
            })),
            capacity,
        }
    }

    /// Register a new subscriber. Returns an opaque handle used to
    /// unsubscribe plus the `Subscription` to drain.
    pub async fn subscribe(&self) -> (u64, Subscription) {
        let dropped = Arc::new(AtomicU64::new(0));
        let notify = Arc::new(Notify::new());
        let mut inner = self.inner.lock().await;
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(
            id,
            Subscriber {
                buf: VecDeque::with_capacity(self.capacity.max(1)),
                capacity: self.capacity.max(1),
                notify: notify.clone(),
                dropped: dropped.clone(),
            },
        );
        (
            id,
            Subscription {
                id,
                bus: self.clone(),
                notify,
                dropped,
            },
        )
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.inner.lock().await.subscribers.remove(&id);
    }

    /// Publish to every current subscriber. Each subscriber's queue is
    /// independent: a full queue evicts its own oldest entry to make room
    /// for the new one rather than blocking this publish or affecting other
    /// subscribers' delivery order (spec.md §4.A's drop-oldest policy).
    pub async fn publish(&self, event: Event) {
        let mut inner = self.inner.lock().await;
        for sub in inner.subscribers.values_mut() {
            if sub.buf.len() >= sub.capacity {
                sub.buf.pop_front();
                sub.dropped.fetch_add(1, Ordering::Relaxed);
            }
            sub.buf.push_back(event.clone());
            sub.notify.notify_one();
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_all_subscribers() {
        let bus = EventBus::new(4);
        let (_id_a, mut a) = bus.subscribe().await;
        let (_id_b, mut b) = bus.subscribe().await;

        bus.publish(Event::Heartbeat).await;

        assert!(matches!(a.recv().await, Some(Event::Heartbeat)));
        assert!(matches!(b.recv().await, Some(Event::Heartbeat)));
    }

    #[tokio::test]
    async fn drops_oldest_when_subscriber_is_slow() {
        let bus = EventBus::new(2);
        let (_id, mut sub) = bus.subscribe().await;

        for i in 0..5u32 {
            bus.publish(Event::WorkerActivity {
                process_id: i.to_string(),
                active: true,
            })
            .await;
        }

        assert_eq!(sub.dropped_count(), 3);
        // The two surviving entries are the most recent publishes (3, 4):
        // drop-oldest evicts from the front, never the tail.
        match sub.recv().await {
            Some(Event::WorkerActivity { process_id, .. }) => assert_eq!(process_id, "3"),
            other => panic!("unexpected event: {other:?}"),
        }
        match sub.recv().await {
            Some(Event::WorkerActivity { process_id, .. }) => assert_eq!(process_id, "4"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new(4);
        let (id, sub) = bus.subscribe().await;
        bus.unsubscribe(id).await;
        drop(sub);

        bus.publish(Event::Heartbeat).await;
        assert_eq!(bus.subscriber_count().await, 0);
    }
}
