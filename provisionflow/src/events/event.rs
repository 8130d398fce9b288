//! Lifecycle events emitted during provisioning and reset runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The lifecycle events a run emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A run started.
    #[serde(rename = "pipeline.started")]
    PipelineStarted,
    /// A stage is about to be evaluated.
    #[serde(rename = "stage.started")]
    StageStarted,
    /// The stage's effect already held.
    #[serde(rename = "stage.skipped")]
    StageSkipped,
    /// The primary action failed and will be retried.
    #[serde(rename = "stage.retrying")]
    StageRetrying,
    /// The degraded fallback action is about to run.
    #[serde(rename = "stage.fallback")]
    StageFallback,
    /// The stage's effect now holds.
    #[serde(rename = "stage.succeeded")]
    StageSucceeded,
    /// The stage failed.
    #[serde(rename = "stage.failed")]
    StageFailed,
    /// The stage's precondition did not hold.
    #[serde(rename = "stage.precondition_failed")]
    StagePreconditionFailed,
    /// Reset found nothing to remove.
    #[serde(rename = "stage.already_absent")]
    StageAlreadyAbsent,
    /// Reset removed the stage's effect.
    #[serde(rename = "stage.removed")]
    StageRemoved,
    /// The run was cancelled at a stage boundary.
    #[serde(rename = "pipeline.cancelled")]
    PipelineCancelled,
    /// The run finished, successfully or not.
    #[serde(rename = "pipeline.completed")]
    PipelineCompleted,
}

impl EventType {
    /// Returns the dotted event name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PipelineStarted => "pipeline.started",
            Self::StageStarted => "stage.started",
            Self::StageSkipped => "stage.skipped",
            Self::StageRetrying => "stage.retrying",
            Self::StageFallback => "stage.fallback",
            Self::StageSucceeded => "stage.succeeded",
            Self::StageFailed => "stage.failed",
            Self::StagePreconditionFailed => "stage.precondition_failed",
            Self::StageAlreadyAbsent => "stage.already_absent",
            Self::StageRemoved => "stage.removed",
            Self::PipelineCancelled => "pipeline.cancelled",
            Self::PipelineCompleted => "pipeline.completed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event with its run correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionEvent {
    /// The event type.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// The run that emitted it.
    pub run_id: Uuid,
    /// Pipeline name.
    pub pipeline: String,
    /// Stage name, for stage events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Event payload.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ProvisionEvent {
    /// Creates a pipeline-level event.
    #[must_use]
    pub fn pipeline(event_type: EventType, run_id: Uuid, pipeline: impl Into<String>) -> Self {
        Self {
            event_type,
            run_id,
            pipeline: pipeline.into(),
            stage: None,
            timestamp: Utc::now(),
            data: serde_json::Value::Null,
        }
    }

    /// Sets the stage name.
    #[must_use]
    pub fn for_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}
