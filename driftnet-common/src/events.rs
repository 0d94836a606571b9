//! Event types for the driftnet event system
//!
//! Lifecycle and progress events for scrape jobs, library scans, and repair
//! runs are broadcast on an in-process [`EventBus`]. Observers (the UI layer,
//! the CLI, tests) subscribe; emitters never block on slow consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Driftnet event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IngestEvent {
    /// A scrape job started for a source
    ScrapeStarted {
        source_id: i64,
        history_id: i64,
        url: String,
        tool: String,
        timestamp: DateTime<Utc>,
    },

    /// Periodic scrape progress (mirrored from the tool's output)
    ScrapeProgress {
        source_id: i64,
        downloaded: u64,
        skipped: u64,
        errors: u64,
        total_bytes: u64,
        speed: u64,
        rate_limited: bool,
        timestamp: DateTime<Utc>,
    },

    /// A scrape job reached a terminal state
    ScrapeFinished {
        source_id: i64,
        history_id: i64,
        status: String,
        files: u64,
        timestamp: DateTime<Utc>,
    },

    /// A library reconciliation pass started
    ScanStarted {
        scan_id: i64,
        timestamp: DateTime<Utc>,
    },

    /// Per-batch reconciliation progress
    ScanProgress {
        scan_id: i64,
        processed: u64,
        added: u64,
        updated: u64,
        errors: u64,
        timestamp: DateTime<Utc>,
    },

    /// A library reconciliation pass reached a terminal state
    ScanFinished {
        scan_id: i64,
        status: String,
        deleted: u64,
        timestamp: DateTime<Utc>,
    },

    /// A repair run changed state (scanning/repairing/paused/terminal)
    RepairStateChanged {
        run_id: i64,
        state: String,
        timestamp: DateTime<Utc>,
    },
}

impl IngestEvent {
    /// Event type name as used in the serialized `type` tag
    pub fn event_type(&self) -> &'static str {
        match self {
            IngestEvent::ScrapeStarted { .. } => "ScrapeStarted",
            IngestEvent::ScrapeProgress { .. } => "ScrapeProgress",
            IngestEvent::ScrapeFinished { .. } => "ScrapeFinished",
            IngestEvent::ScanStarted { .. } => "ScanStarted",
            IngestEvent::ScanProgress { .. } => "ScanProgress",
            IngestEvent::ScanFinished { .. } => "ScanFinished",
            IngestEvent::RepairStateChanged { .. } => "RepairStateChanged",
        }
    }
}

/// Broadcast event bus shared by all driftnet services.
///
/// Wraps a `tokio::sync::broadcast` channel: every subscriber receives every
/// event emitted after its subscription; lagging subscribers lose the oldest
/// events rather than blocking emitters.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IngestEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a new EventBus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers.
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists,
    /// `Err` if nobody is listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: IngestEvent,
    ) -> std::result::Result<usize, broadcast::error::SendError<IngestEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring whether anyone is listening.
    ///
    /// Progress events use this: it is acceptable for them to go unobserved.
    pub fn emit_lossy(&self, event: IngestEvent) {
        let _ = self.tx.send(event);
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_type_tag() {
        let event = IngestEvent::ScanStarted {
            scan_id: 7,
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"ScanStarted\""));
        assert!(json.contains("\"scan_id\":7"));

        let back: IngestEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type(), "ScanStarted");
    }

    #[test]
    fn emit_lossy_without_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        for _ in 0..16 {
            bus.emit_lossy(IngestEvent::ScanStarted {
                scan_id: 1,
                timestamp: Utc::now(),
            });
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(IngestEvent::ScanFinished {
            scan_id: 3,
            status: "completed".to_string(),
            deleted: 2,
            timestamp: Utc::now(),
        })
        .unwrap();

        match rx.recv().await.unwrap() {
            IngestEvent::ScanFinished { scan_id, deleted, .. } => {
                assert_eq!(scan_id, 3);
                assert_eq!(deleted, 2);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
