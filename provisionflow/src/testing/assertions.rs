//! Test assertions for run reports.

use crate::core::StageOutcome;
use crate::errors::ErrorKind;
use crate::pipeline::PipelineReport;

/// Asserts that the run succeeded.
pub fn assert_run_succeeded(report: &PipelineReport) {
    assert!(
        report.is_success(),
        "Expected success, got: {} (first failure: {:?})",
        report.summary(),
        report.first_failure
    );
}

/// Asserts that every recorded stage was skipped.
pub fn assert_all_skipped(report: &PipelineReport) {
    assert!(
        report.all_skipped(),
        "Expected every stage to be skipped, got {:?}",
        report.outcomes()
    );
}

/// Asserts the recorded outcomes, in order.
pub fn assert_outcomes(report: &PipelineReport, expected: &[(&str, StageOutcome)]) {
    let actual = report.outcomes();
    let expected: Vec<(String, StageOutcome)> = expected
        .iter()
        .map(|(name, outcome)| ((*name).to_string(), *outcome))
        .collect();
    assert_eq!(actual, expected, "Stage outcomes differ");
}

/// Asserts that the run stopped at `stage` with an error of `kind`.
pub fn assert_failed_at(report: &PipelineReport, stage: &str, kind: ErrorKind) {
    let failure = report
        .first_failure
        .as_ref()
        .unwrap_or_else(|| panic!("Expected a failure at '{stage}', got: {}", report.summary()));
    assert_eq!(failure.stage, stage, "First failure is at the wrong stage");
    assert_eq!(
        failure.kind, kind,
        "First failure has the wrong kind: {}",
        failure.message
    );
}

/// Asserts that the named stages were never attempted.
pub fn assert_not_attempted(report: &PipelineReport, stages: &[&str]) {
    assert_eq!(
        report.not_attempted, stages,
        "Stages not attempted differ"
    );
}
