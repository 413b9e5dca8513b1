//! Push hub: fan-out of structured events to connected observers.
//!
//! Each observer owns a bounded queue. Publishing never blocks: a full or
//! closed queue drops that observer, the rest keep receiving in FIFO order.

pub mod events;

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, warn};

pub use events::{
    DataAction, DataFileRef, Event, EventKind, EtaKind, LicenseLiveness, OutputLevel,
};

/// Default per-observer queue depth.
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Identifier of one connected observer.
pub type ObserverId = u64;

/// A live subscription. The receiver yields events in publish order; when
/// the hub drops the observer (slow consumer or shutdown) the channel closes.
pub struct Subscription {
    pub id: ObserverId,
    pub rx: mpsc::Receiver<Event>,
}

struct Observer {
    tx: mpsc::Sender<Event>,
}

/// Concurrent event fan-out switch.
pub struct PushHub {
    observers: RwLock<HashMap<ObserverId, Observer>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Default for PushHub {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl PushHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    /// Register a new observer and hand back its queue.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        self.observers
            .write()
            .expect("hub observer set poisoned")
            .insert(id, Observer { tx });
        debug!(observer = id, "observer subscribed");
        Subscription { id, rx }
    }

    /// Remove an observer; its channel closes when the sender drops.
    pub fn unsubscribe(&self, id: ObserverId) {
        if self
            .observers
            .write()
            .expect("hub observer set poisoned")
            .remove(&id)
            .is_some()
        {
            debug!(observer = id, "observer unsubscribed");
        }
    }

    /// Deliver one event to every live observer.
    ///
    /// Uses `try_send` so a stalled consumer costs at most its own queue:
    /// when an observer's queue is full (or its receiver is gone) the
    /// observer is dropped, never the producer.
    pub fn publish(&self, event: Event) {
        let mut dropped: Vec<ObserverId> = Vec::new();
        {
            let observers = self.observers.read().expect("hub observer set poisoned");
            for (id, observer) in observers.iter() {
                match observer.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(observer = id, "observer queue full, dropping observer");
                        dropped.push(*id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(*id),
                }
            }
        }
        if !dropped.is_empty() {
            let mut observers = self.observers.write().expect("hub observer set poisoned");
            for id in dropped {
                observers.remove(&id);
            }
        }
    }

    pub fn publish_kind(&self, kind: EventKind) {
        self.publish(Event::new(kind));
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .expect("hub observer set poisoned")
            .len()
    }

    /// Notify every observer of shutdown and close all channels.
    pub fn shutdown(&self, reason: &str) {
        self.publish_kind(EventKind::Disconnect {
            reason: reason.to_string(),
        });
        self.observers
            .write()
            .expect("hub observer set poisoned")
            .clear();
    }
}
