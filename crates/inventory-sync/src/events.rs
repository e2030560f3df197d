//! Event infrastructure for inventory-sync.
//!
//! Provides `SyncEvent` for monitoring and `EventBus` for subscriptions.
//! Wrap the bus in `Arc` to subscribe; the returned `Subscription`
//! unsubscribes when dropped.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::engine::SyncStatus;

/// Events emitted during sync cycles.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// The engine's observable status changed.
    StatusChanged {
        status: SyncStatus,
        /// Milliseconds since Unix epoch.
        timestamp: u64,
    },
    /// Changes for one zone were fetched.
    ZoneFetched {
        zone: String,
        modified: usize,
        deleted: usize,
    },
    /// An inbound record could not be decoded and was skipped.
    RecordDropped { record: String, reason: String },
    /// An inbound record was ignored because it is tombstoned locally.
    RecordSuppressed { record: String },
    /// One outbound batch finished.
    BatchSent { saved: usize, failed: usize },
    /// Tombstone deletes were pushed to the remote store.
    TombstonesFlushed { acknowledged: usize, failed: usize },
}

/// Subscription handle that unsubscribes automatically when dropped.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// Event bus for publishing sync events to subscribers.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run while emit holds the read lock during unwinding
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: SyncEvent) {
        // Snapshot so a callback may subscribe without deadlocking
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_subscription_receives_events_until_dropped() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let subscription = bus.subscribe(move |event| {
            sink.lock().unwrap().push(event);
        });
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit(SyncEvent::BatchSent {
            saved: 2,
            failed: 0,
        });
        drop(subscription);
        bus.emit(SyncEvent::BatchSent {
            saved: 1,
            failed: 1,
        });

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = SyncEvent::ZoneFetched {
            zone: "Items".into(),
            modified: 3,
            deleted: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "zoneFetched");
        assert_eq!(json["zone"], "Items");
        assert_eq!(json["modified"], 3);

        let event = SyncEvent::StatusChanged {
            status: SyncStatus::Error("offline".into()),
            timestamp: 5,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "statusChanged");
        assert_eq!(json["status"]["error"], "offline");
    }
}
