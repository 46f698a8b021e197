//! Lifecycle events for bulk operations.
//!
//! The coordinator reports run progress to an injected [`EventSink`]. Events
//! are advisory; persistence of operation state never depends on them.

mod event;
mod sink;

pub use event::BulkEvent;
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
