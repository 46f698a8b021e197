//! Event sink trait and implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, Level};

use super::BulkEvent;

/// Receives lifecycle events.
///
/// Sinks are injected into the coordinator; a slow or failing sink must never
/// affect record processing.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event: BulkEvent);

    /// Emits an event without blocking. Never fails.
    fn try_emit(&self, event: BulkEvent);
}

/// A sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: BulkEvent) {}

    fn try_emit(&self, _event: BulkEvent) {}
}

/// A sink that logs events through `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink at the given level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &BulkEvent) {
        let event_type = event.event_type();
        let operation_id = event.operation_id();
        let payload = event.to_json();
        if self.level == Level::DEBUG || matches!(event, BulkEvent::RecordCompleted { .. }) {
            debug!(event_type, %operation_id, event_data = %payload, "event: {event_type}");
        } else {
            info!(event_type, %operation_id, event_data = %payload, "event: {event_type}");
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: BulkEvent) {
        self.log_event(&event);
    }

    fn try_emit(&self, event: BulkEvent) {
        self.log_event(&event);
    }
}

/// A sink that keeps every event, for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<BulkEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All collected events in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<BulkEvent> {
        self.events.read().clone()
    }

    /// Number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Events with the given dotted name.
    #[must_use]
    pub fn events_of_type(&self, event_type: &str) -> Vec<BulkEvent> {
        self.events
            .read()
            .iter()
            .filter(|event| event.event_type() == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: BulkEvent) {
        self.events.write().push(event);
    }

    fn try_emit(&self, event: BulkEvent) {
        self.events.write().push(event);
    }
}
