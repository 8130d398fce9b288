//! Event sink trait and implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn, Level};

use super::{EventType, ProvisionEvent};

/// Receives lifecycle events.
///
/// Sinks must not fail the run: delivery problems are logged and suppressed.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event.
    async fn emit(&self, event: &ProvisionEvent);
}

/// A sink that discards all events. Used when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &ProvisionEvent) {}
}

/// A sink that writes events to `tracing`.
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
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: &ProvisionEvent) {
        let stage = event.stage.as_deref().unwrap_or("-");
        let failure = matches!(
            event.event_type,
            EventType::StageFailed | EventType::StagePreconditionFailed
        );
        if failure {
            warn!(
                event_type = %event.event_type,
                run_id = %event.run_id,
                pipeline = %event.pipeline,
                stage,
                event_data = %event.data,
                "Event: {}", event.event_type
            );
        } else if self.level == Level::DEBUG {
            debug!(
                event_type = %event.event_type,
                run_id = %event.run_id,
                pipeline = %event.pipeline,
                stage,
                event_data = %event.data,
                "Event: {}", event.event_type
            );
        } else {
            info!(
                event_type = %event.event_type,
                run_id = %event.run_id,
                pipeline = %event.pipeline,
                stage,
                event_data = %event.data,
                "Event: {}", event.event_type
            );
        }
    }
}

/// A sink that keeps every event, for tests and reports.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<ProvisionEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<ProvisionEvent> {
        self.events.read().clone()
    }

    /// Returns the collected event types, in order.
    #[must_use]
    pub fn types(&self) -> Vec<EventType> {
        self.events.read().iter().map(|e| e.event_type).collect()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns the events for one stage.
    #[must_use]
    pub fn for_stage(&self, stage: &str) -> Vec<EventType> {
        self.events
            .read()
            .iter()
            .filter(|e| e.stage.as_deref() == Some(stage))
            .map(|e| e.event_type)
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: &ProvisionEvent) {
        self.events.write().push(event.clone());
    }
}
