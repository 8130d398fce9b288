//! Per-stage results recorded by the orchestrator and reset engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{StageKind, StageOutcome, StageState};
use crate::errors::{ErrorKind, ProvisionError};

/// The error that ended a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    /// Classification.
    pub kind: ErrorKind,
    /// Human-readable detail, never containing secret values.
    pub message: String,
    /// True if re-running later may succeed without operator action.
    pub transient: bool,
}

impl From<&ProvisionError> for StageError {
    fn from(err: &ProvisionError) -> Self {
        let kind = err.kind();
        Self {
            kind,
            message: err.to_string(),
            transient: err.is_retryable(),
        }
    }
}

/// The outcome of one stage within one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage name.
    pub stage_name: String,
    /// Stage kind.
    pub kind: StageKind,
    /// Final outcome.
    pub outcome: StageOutcome,
    /// Number of `apply` (or `teardown`) invocations, fallback included.
    pub attempts: u32,
    /// Whether the fallback strategy ran.
    pub fallback_used: bool,
    /// States visited, in order.
    pub transitions: Vec<StageState>,
    /// Short note (for example "already absent").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// The error that ended the stage, if it failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
    /// When evaluation started.
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl StageResult {
    /// Creates a result.
    #[must_use]
    pub fn new(
        stage_name: impl Into<String>,
        kind: StageKind,
        outcome: StageOutcome,
        started_at: DateTime<Utc>,
    ) -> Self {
        let duration_ms = u64::try_from((Utc::now() - started_at).num_milliseconds()).unwrap_or(0);
        Self {
            stage_name: stage_name.into(),
            kind,
            outcome,
            attempts: 0,
            fallback_used: false,
            transitions: Vec::new(),
            detail: None,
            error: None,
            started_at,
            duration_ms,
        }
    }

    /// Sets the attempt count.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Marks the fallback as used.
    #[must_use]
    pub fn with_fallback_used(mut self, used: bool) -> Self {
        self.fallback_used = used;
        self
    }

    /// Sets the visited states.
    #[must_use]
    pub fn with_transitions(mut self, transitions: Vec<StageState>) -> Self {
        self.transitions = transitions;
        self
    }

    /// Sets the detail note.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Sets the error.
    #[must_use]
    pub fn with_error(mut self, error: &ProvisionError) -> Self {
        self.error = Some(StageError::from(error));
        self
    }

    /// Returns true if later stages may proceed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}
