//! Lifecycle events for observability.
//!
//! Sinks are passed to the orchestrator and reset engine explicitly; there is
//! no process-wide sink.

mod event;
mod sink;

pub use event::{EventType, ProvisionEvent};
pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
