//! Span attributes for runs and stages.
//!
//! The orchestrator and the reset engine open one `tracing` span per run and
//! one per stage from these attributes, so every log line a stage emits
//! carries the run id, pipeline and stage name.

use serde::Serialize;
use tracing::Span;

use crate::context::RunIdentity;
use crate::core::StageKind;

/// Span attributes for one run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSpanAttributes {
    /// Pipeline name.
    pub pipeline_name: String,
    /// Run id.
    pub pipeline_run_id: String,
    /// Target environment.
    pub environment: String,
    /// Provision or reset.
    pub mode: String,
    /// Number of stages.
    pub stage_count: usize,
}

impl PipelineSpanAttributes {
    /// Creates attributes for a run.
    #[must_use]
    pub fn for_run(identity: &RunIdentity) -> Self {
        Self {
            pipeline_name: identity.pipeline.clone(),
            pipeline_run_id: identity.run_id.to_string(),
            environment: identity.environment.clone(),
            mode: identity.mode.to_string(),
            stage_count: 0,
        }
    }

    /// Sets the stage count.
    #[must_use]
    pub fn with_stage_count(mut self, count: usize) -> Self {
        self.stage_count = count;
        self
    }

    /// Opens an `info` span carrying these attributes.
    #[must_use]
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "pipeline",
            pipeline = %self.pipeline_name,
            run_id = %self.pipeline_run_id,
            environment = %self.environment,
            mode = %self.mode,
            stages = self.stage_count,
        )
    }
}

/// Span attributes for one stage evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct StageSpanAttributes {
    /// Stage name.
    pub stage_name: String,
    /// Stage kind.
    pub stage_kind: Option<String>,
}

impl StageSpanAttributes {
    /// Creates attributes for a stage.
    #[must_use]
    pub fn new(stage_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            stage_kind: None,
        }
    }

    /// Sets the stage kind.
    #[must_use]
    pub fn with_kind(mut self, kind: StageKind) -> Self {
        self.stage_kind = Some(kind.to_string());
        self
    }

    /// Opens an `info` span for the stage.
    #[must_use]
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "stage",
            stage = %self.stage_name,
            kind = self.stage_kind.as_deref().unwrap_or("custom"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunMode;

    #[test]
    fn test_pipeline_span_attributes() {
        let identity = RunIdentity::new("demo", "dataspace", RunMode::Reset);
        let attrs = PipelineSpanAttributes::for_run(&identity).with_stage_count(8);

        assert_eq!(attrs.pipeline_name, "dataspace");
        assert_eq!(attrs.mode, "reset");
        assert_eq!(attrs.stage_count, 8);
        assert_eq!(attrs.pipeline_run_id, identity.run_id.to_string());
        let _span = attrs.span();
    }

    #[test]
    fn test_stage_span_attributes() {
        let attrs = StageSpanAttributes::new("release").with_kind(StageKind::Release);
        assert_eq!(attrs.stage_name, "release");
        assert_eq!(attrs.stage_kind.as_deref(), Some("release"));
        assert!(StageSpanAttributes::new("x").stage_kind.is_none());
        let _span = attrs.span();
    }
}
