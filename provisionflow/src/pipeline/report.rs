//! Run reports returned by the orchestrator and the reset engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::{RunIdentity, RunMode};
use crate::core::StageOutcome;
use crate::errors::ErrorKind;
use crate::stages::StageResult;

/// Process exit code for a successful run.
pub const EXIT_SUCCESS: i32 = 0;
/// Process exit code for usage or configuration errors.
pub const EXIT_CONFIG: i32 = 1;
/// Process exit code when a precondition did not hold.
pub const EXIT_PRECONDITION: i32 = 2;
/// Process exit code when a stage could not be brought to its desired state.
pub const EXIT_FAILED: i32 = 3;
/// Process exit code when a credential could not be resolved.
pub const EXIT_SECRET: i32 = 4;
/// Process exit code for a cancelled run.
pub const EXIT_CANCELLED: i32 = 5;

/// The first failure of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    /// The failing stage.
    pub stage: String,
    /// Error classification.
    pub kind: ErrorKind,
    /// Diagnostic message.
    pub message: String,
    /// Whether the fallback strategy was tried.
    pub fallback_attempted: bool,
    /// True for "transient, retry later", false for "structural, fix the
    /// environment first".
    pub transient: bool,
}

impl FailureDetail {
    fn from_result(result: &StageResult) -> Option<Self> {
        let error = result.error.as_ref()?;
        Some(Self {
            stage: result.stage_name.clone(),
            kind: error.kind,
            message: error.message.clone(),
            fallback_attempted: result.fallback_used,
            transient: error.transient,
        })
    }
}

/// Outcome of one provisioning or reset run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    /// The run id.
    pub run_id: Uuid,
    /// Pipeline name.
    pub pipeline: String,
    /// Target environment.
    pub environment: String,
    /// Provision or reset.
    pub mode: RunMode,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Total wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Results of the stages that were evaluated, in evaluation order.
    pub stages: Vec<StageResult>,
    /// Stages that were never evaluated because the run stopped early.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub not_attempted: Vec<String>,
    /// The first failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_failure: Option<FailureDetail>,
    /// Whether the run was cancelled at a stage boundary.
    pub cancelled: bool,
}

/// Reset runs report in the same shape as provisioning runs.
pub type ResetReport = PipelineReport;

impl PipelineReport {
    /// Starts an empty report for a run.
    #[must_use]
    pub fn start(identity: &RunIdentity) -> Self {
        Self {
            run_id: identity.run_id,
            pipeline: identity.pipeline.clone(),
            environment: identity.environment.clone(),
            mode: identity.mode,
            started_at: identity.started_at,
            duration_ms: 0,
            stages: Vec::new(),
            not_attempted: Vec::new(),
            first_failure: None,
            cancelled: false,
        }
    }

    /// Records a stage result. The first failing result becomes the run's
    /// first failure.
    pub fn record(&mut self, result: StageResult) {
        if self.first_failure.is_none() && !result.is_success() {
            self.first_failure = FailureDetail::from_result(&result);
        }
        self.stages.push(result);
    }

    /// Marks the run as stopped before the given stages.
    pub fn stop_before(&mut self, remaining: impl IntoIterator<Item = String>) {
        self.not_attempted.extend(remaining);
    }

    /// Marks the run as cancelled.
    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    /// Stamps the total duration.
    pub fn finish(&mut self) {
        self.duration_ms =
            u64::try_from((Utc::now() - self.started_at).num_milliseconds()).unwrap_or(0);
    }

    /// Returns true if every stage succeeded or was skipped and the run was
    /// not cancelled.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.not_attempted.is_empty() && self.stages.iter().all(StageResult::is_success)
    }

    /// Returns the outcome of a stage, if it was evaluated.
    #[must_use]
    pub fn outcome(&self, stage: &str) -> Option<StageOutcome> {
        self.result(stage).map(|r| r.outcome)
    }

    /// Returns the result of a stage, if it was evaluated.
    #[must_use]
    pub fn result(&self, stage: &str) -> Option<&StageResult> {
        self.stages.iter().find(|r| r.stage_name == stage)
    }

    /// Returns the outcomes of every evaluated stage, in order.
    #[must_use]
    pub fn outcomes(&self) -> Vec<(String, StageOutcome)> {
        self.stages
            .iter()
            .map(|r| (r.stage_name.clone(), r.outcome))
            .collect()
    }

    /// Returns true if every stage was evaluated and skipped.
    #[must_use]
    pub fn all_skipped(&self) -> bool {
        self.is_success() && self.stages.iter().all(|r| r.outcome == StageOutcome::Skipped)
    }

    /// Returns the total number of `apply` or `teardown` invocations.
    #[must_use]
    pub fn total_attempts(&self) -> u32 {
        self.stages.iter().map(|r| r.attempts).sum()
    }

    /// Maps the report to a process exit code.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            return EXIT_CANCELLED;
        }
        match &self.first_failure {
            None if self.is_success() => EXIT_SUCCESS,
            None => EXIT_FAILED,
            Some(failure) => match failure.kind {
                ErrorKind::PreconditionFailed => EXIT_PRECONDITION,
                ErrorKind::SecretUnavailable => EXIT_SECRET,
                ErrorKind::Cancelled => EXIT_CANCELLED,
                ErrorKind::Invalid => EXIT_CONFIG,
                ErrorKind::ApplyFailed | ErrorKind::VerifyFailed | ErrorKind::TimeoutExceeded => {
                    EXIT_FAILED
                }
            },
        }
    }

    /// One-line human summary.
    #[must_use]
    pub fn summary(&self) -> String {
        let done = self.stages.iter().filter(|r| r.outcome.did_work()).count();
        let skipped = self
            .stages
            .iter()
            .filter(|r| r.outcome == StageOutcome::Skipped)
            .count();
        let status = if self.cancelled {
            "cancelled".to_string()
        } else if let Some(failure) = &self.first_failure {
            format!("failed at {} ({})", failure.stage, failure.kind)
        } else {
            "succeeded".to_string()
        };
        format!(
            "{} {} {}: {status}; {done} changed, {skipped} skipped, {} not attempted in {}ms",
            self.mode,
            self.pipeline,
            self.environment,
            self.not_attempted.len(),
            self.duration_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageKind;
    use crate::errors::ProvisionError;
    use pretty_assertions::assert_eq;

    fn report() -> PipelineReport {
        PipelineReport::start(&RunIdentity::new("demo", "dataspace", RunMode::Provision))
    }

    fn result(name: &str, outcome: StageOutcome) -> StageResult {
        StageResult::new(name, StageKind::Custom, outcome, Utc::now())
    }

    #[test]
    fn test_success_report() {
        let mut report = report();
        report.record(result("namespace", StageOutcome::Skipped));
        report.record(result("release", StageOutcome::Retried));
        report.finish();

        assert!(report.is_success());
        assert!(!report.all_skipped());
        assert_eq!(report.exit_code(), EXIT_SUCCESS);
        assert_eq!(report.outcome("release"), Some(StageOutcome::Retried));
        assert_eq!(report.outcome("missing"), None);
        assert!(report.summary().starts_with("provision dataspace demo: succeeded; 1 changed, 1 skipped"));
    }

    #[test]
    fn test_first_failure_is_kept() {
        let mut report = report();
        let err = ProvisionError::precondition_failed("database", "pod/db/postgres-0 is not present");
        report.record(result("database", StageOutcome::PreconditionFailed).with_error(&err));
        report.record(
            result("release", StageOutcome::Failed)
                .with_error(&ProvisionError::apply_failed("release", "boom")),
        );
        report.stop_before(vec!["verify".to_string()]);

        let failure = report.first_failure.clone().unwrap();
        assert_eq!(failure.stage, "database");
        assert_eq!(failure.kind, ErrorKind::PreconditionFailed);
        assert!(!failure.transient);
        assert!(!report.is_success());
        assert_eq!(report.exit_code(), EXIT_PRECONDITION);
    }

    #[test]
    fn test_exit_codes_by_kind() {
        let mut secret = report();
        secret.record(result("database", StageOutcome::Failed).with_error(&ProvisionError::SecretUnavailable {
            secret: "db/pg#password".to_string(),
            reason: "not found".to_string(),
        }));
        assert_eq!(secret.exit_code(), EXIT_SECRET);

        let mut failed = report();
        failed.record(
            result("release", StageOutcome::Failed)
                .with_fallback_used(true)
                .with_error(&ProvisionError::apply_failed("release", "timed out")),
        );
        assert_eq!(failed.exit_code(), EXIT_FAILED);
        assert!(failed.first_failure.unwrap().fallback_attempted);

        let mut cancelled = report();
        cancelled.mark_cancelled();
        cancelled.stop_before(vec!["namespace".to_string()]);
        assert_eq!(cancelled.exit_code(), EXIT_CANCELLED);
    }

    #[test]
    fn test_report_serialization() {
        let mut report = report();
        report.record(result("namespace", StageOutcome::Skipped));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["mode"], "provision");
        assert_eq!(json["stages"][0]["outcome"], "skipped");
        assert!(json.get("first_failure").is_none());
        assert!(json.get("not_attempted").is_none());
    }
}
