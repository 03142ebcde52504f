//! Load notifications
//!
//! Consumers such as diagnostic panels subscribe to a stream of events
//! instead of re-scanning coordinator state on a timer.

use std::sync::atomic::{AtomicU64, Ordering};

use async_broadcast::{InactiveReceiver, Receiver, Sender, TrySendError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

use crate::core::errors::LoadError;
use crate::ledger::LoadStatus;

/// Events emitted while a manifest is being loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LoadEvent {
    StageStarted {
        stage: u32,
        resources: Vec<String>,
    },
    ResourceStarted {
        id: String,
        stage: u32,
    },
    ResourceLoaded {
        id: String,
        duration_ms: u64,
    },
    /// The ledger already owned or finished this resource
    ResourceReused {
        id: String,
        status: LoadStatus,
    },
    ResourceFailed {
        id: String,
        error: LoadError,
    },
    StageSettled {
        stage: u32,
        failed: usize,
    },
    Cancelled {
        stage: u32,
    },
    Finalized {
        partially_failed: bool,
    },
}

/// Event envelope with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadEventEnvelope {
    pub sequence: u64,
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event: LoadEvent,
}

/// Bounded fan-out of load events. When a subscriber falls behind, the
/// oldest events are dropped for it rather than blocking loads.
pub struct EventBus {
    tx: Sender<LoadEventEnvelope>,
    // Keeps the channel open while nobody is subscribed
    idle: InactiveReceiver<LoadEventEnvelope>,
    sequence: AtomicU64,
    run_id: Uuid,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (mut tx, rx) = async_broadcast::broadcast(capacity.max(1));
        tx.set_overflow(true);
        Self {
            tx,
            idle: rx.deactivate(),
            sequence: AtomicU64::new(0),
            run_id: Uuid::new_v4(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> Receiver<LoadEventEnvelope> {
        self.idle.activate_cloned()
    }

    pub fn emit(&self, event: LoadEvent) {
        let envelope = LoadEventEnvelope {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            run_id: self.run_id,
            timestamp: Utc::now(),
            event,
        };
        trace!(sequence = envelope.sequence, "Event: {:?}", envelope.event);
        match self.tx.try_broadcast(envelope) {
            Ok(_) | Err(TrySendError::Inactive(_)) => {}
            Err(e) => trace!("Dropped event: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(LoadEvent::StageStarted {
            stage: 0,
            resources: vec!["x".into()],
        });
        bus.emit(LoadEvent::StageSettled { stage: 0, failed: 0 });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
        assert_eq!(first.run_id, bus.run_id());
        assert!(matches!(second.event, LoadEvent::StageSettled { stage: 0, .. }));
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(2);
        for stage in 0..10 {
            bus.emit(LoadEvent::Cancelled { stage });
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_overflows_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for stage in 0..5 {
            bus.emit(LoadEvent::Cancelled { stage });
        }
        // The three oldest events were pushed out of the ring
        assert!(rx.recv().await.is_err());
        let next = rx.recv().await.unwrap();
        assert_eq!(next.event, LoadEvent::Cancelled { stage: 3 });
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(LoadEvent::ResourceLoaded {
            id: "x".into(),
            duration_ms: 4,
        })
        .unwrap();
        assert_eq!(json["type"], "ResourceLoaded");
    }
}
