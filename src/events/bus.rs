//! Event Bus - fan-out of engine progress events
//!
//! Each subscriber gets its own bounded queue. `emit` delivers with
//! `try_send` and drops on a full queue: progress reporting must never
//! throttle the engine. Dropped receivers are pruned on the next emit.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::debug;

use super::types::EngineEvent;

/// Per-subscriber queue capacity (events)
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 1000;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<EngineEvent>,
}

/// Central event bus for engine progress streaming
///
/// Emitting is cheap, synchronous, and infallible. Subscribers that fall
/// behind lose events rather than slowing anyone down; each subscriber sees
/// its own delivered events in emit order.
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Emit an event to all subscribers
    ///
    /// Fire-and-forget: no subscribers is fine, full queues drop the event.
    pub fn emit(&self, event: EngineEvent) {
        let mut subs = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.retain(|s| !s.tx.is_closed());
        debug!(event_type = %event.event_type, subscriber_count = subs.len(), "EventBus::emit");
        for sub in subs.iter() {
            let _ = sub.tx.try_send(event.clone());
        }
    }

    /// Subscribe to receive events emitted after this call
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(%id, "EventBus::subscribe: new subscriber");
        let mut subs = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.push(Subscriber { id, tx });
        EventStream { id, rx }
    }

    /// Remove a subscriber's queue from the bus
    ///
    /// Dropping the [`EventStream`] has the same effect on the next emit;
    /// this just makes the removal immediate.
    pub fn unsubscribe(&self, stream: &EventStream) {
        debug!(id = %stream.id, "EventBus::unsubscribe");
        let mut subs = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.retain(|s| s.id != stream.id);
    }

    pub fn subscriber_count(&self) -> usize {
        match self.subscribers.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber's receiving end of the bus
pub struct EventStream {
    id: u64,
    rx: mpsc::Receiver<EngineEvent>,
}

impl EventStream {
    /// Wait for the next event; None when the bus is gone
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        self.rx.recv().await
    }

    /// Take an event if one is queued
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        self.rx.try_recv().ok()
    }
}
