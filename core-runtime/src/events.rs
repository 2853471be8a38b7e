//! # Event Bus System
//!
//! Broadcasts what the sync engine is doing to any interested listener
//! (dashboards, alerting, tests) over `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! - **Event Types**: [`ImportEvent`] for per-source import runs and
//!   [`ReconciliationEvent`] for stale-inventory passes, wrapped in [`CoreEvent`]
//! - **EventBus**: Central broadcast channel
//! - **EventStream**: Receiver wrapper with optional filtering
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, ImportEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let event_bus = EventBus::new(100);
//! let mut subscriber = event_bus.subscribe();
//!
//! event_bus.emit(CoreEvent::Import(ImportEvent::RunSkipped {
//!     source_id: "7".to_string(),
//!     holder: "run-1".to_string(),
//! })).ok();
//!
//! let event = subscriber.recv().await.unwrap();
//! assert_eq!(event.description(), "Import skipped, source locked");
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   This is non-fatal.
//! - **`RecvError::Closed`**: All senders have been dropped.
//!
//! Emitting with no subscriber returns `Err`; publishers ignore it.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum published through the event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    Import(ImportEvent),
    Reconciliation(ReconciliationEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Import(e) => e.description(),
            CoreEvent::Reconciliation(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Import(ImportEvent::RunFailed { .. }) => EventSeverity::Error,
            CoreEvent::Import(ImportEvent::RunSkipped { .. })
            | CoreEvent::Reconciliation(ReconciliationEvent::Skipped { .. }) => {
                EventSeverity::Warning
            }
            CoreEvent::Import(ImportEvent::RunCompleted { .. })
            | CoreEvent::Reconciliation(ReconciliationEvent::Completed { .. }) => {
                EventSeverity::Info
            }
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Import Events
// ============================================================================

/// Progress of a multi-page import run of one source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ImportEvent {
    /// First page of a run picked up.
    RunStarted {
        source_id: String,
        run_id: String,
        /// Lower bound of the window; `None` for a full resync.
        modified_since: Option<String>,
    },
    /// One page applied.
    PageImported {
        source_id: String,
        run_id: String,
        current_page: u32,
        total_pages: u32,
        active_processed: u64,
        inactive_processed: u64,
    },
    /// Next page handed to a new unit of work.
    ContinuationScheduled {
        source_id: String,
        run_id: String,
        next_page: String,
    },
    /// Last page applied and watermark advanced.
    RunCompleted {
        source_id: String,
        run_id: String,
        active_processed: u64,
        inactive_processed: u64,
    },
    /// Run stopped on an error. The watermark is untouched.
    RunFailed {
        source_id: String,
        run_id: String,
        message: String,
        /// Whether the queue will retry the unit of work.
        retrying: bool,
    },
    /// Another run holds the source lock.
    RunSkipped { source_id: String, holder: String },
}

impl ImportEvent {
    fn description(&self) -> &str {
        match self {
            ImportEvent::RunStarted { .. } => "Import started",
            ImportEvent::PageImported { .. } => "Import page applied",
            ImportEvent::ContinuationScheduled { .. } => "Next import page scheduled",
            ImportEvent::RunCompleted { .. } => "Import completed",
            ImportEvent::RunFailed { .. } => "Import failed",
            ImportEvent::RunSkipped { .. } => "Import skipped, source locked",
        }
    }
}

// ============================================================================
// Reconciliation Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ReconciliationEvent {
    /// Both branches reported and stale identifiers were deactivated.
    Completed {
        source_id: String,
        chord_id: String,
        deactivated: u64,
    },
    /// A branch failed; nothing was deactivated.
    Skipped {
        source_id: String,
        chord_id: String,
        reason: String,
    },
}

impl ReconciliationEvent {
    fn description(&self) -> &str {
        match self {
            ReconciliationEvent::Completed { .. } => "Reconciliation completed",
            ReconciliationEvent::Skipped { .. } => "Reconciliation skipped",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Broadcast channel for [`CoreEvent`]s. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus. Subscribers falling more than `capacity`
    /// events behind receive `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event, returning the number of subscribers reached.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// Receiver that skips events not matching a predicate.
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` will be returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Receives the next event that passes the filter (if any).
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;

            let Some(filter) = &self.filter else {
                return Ok(event);
            };

            if filter(&event) {
                return Ok(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(source_id: &str) -> CoreEvent {
        CoreEvent::Import(ImportEvent::RunCompleted {
            source_id: source_id.to_string(),
            run_id: "run-1".to_string(),
            active_processed: 140,
            inactive_processed: 10,
        })
    }

    #[tokio::test]
    async fn test_event_bus_subscription() {
        let bus = EventBus::new(10);
        assert_eq!(bus.subscriber_count(), 0);
        let _sub1 = bus.subscribe();
        let _sub2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_event_emission_no_subscribers() {
        let bus = EventBus::new(10);
        assert!(bus.emit(completed("1")).is_err());
    }

    #[tokio::test]
    async fn test_event_emission_with_subscribers() {
        let bus = EventBus::new(10);
        let mut sub = bus.subscribe();

        let event = completed("1");
        assert_eq!(bus.emit(event.clone()).unwrap(), 1);
        assert_eq!(sub.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_event_stream_filter() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe())
            .filter(|event| matches!(event, CoreEvent::Reconciliation(_)));

        bus.emit(completed("1")).unwrap();
        let reconciliation = CoreEvent::Reconciliation(ReconciliationEvent::Skipped {
            source_id: "1".to_string(),
            chord_id: "c".to_string(),
            reason: "active branch failed".to_string(),
        });
        bus.emit(reconciliation.clone()).unwrap();

        assert_eq!(stream.recv().await.unwrap(), reconciliation);
    }

    #[test]
    fn test_severity() {
        assert_eq!(completed("1").severity(), EventSeverity::Info);
        let failed = CoreEvent::Import(ImportEvent::RunFailed {
            source_id: "1".to_string(),
            run_id: "r".to_string(),
            message: "boom".to_string(),
            retrying: false,
        });
        assert_eq!(failed.severity(), EventSeverity::Error);
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(completed("9")).unwrap();
        assert_eq!(json["type"], "Import");
        assert_eq!(json["payload"]["event"], "RunCompleted");
        assert_eq!(json["payload"]["source_id"], "9");
    }
}
