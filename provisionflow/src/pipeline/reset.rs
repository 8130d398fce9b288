//! The reset engine: reverse-order destructive teardown.
//!
//! Stages are visited last to first, so a stage's dependents are torn down
//! before it is. Within a stage, `teardown` owns the ordering of its own
//! destructive steps (sessions terminated before a drop, workloads scaled
//! down before an uninstall). "Already absent" is success. After teardown the
//! engine polls the weaker `is_absent` post-check instead of `verify`,
//! because destructive operations converge even when individual calls fail
//! transiently.

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn, Instrument};

use super::{with_retry, Pipeline, PollBudget, ResetReport, RetryPolicy, RunSession, Runtime};
use crate::context::RunMode;
use crate::core::{StageOutcome, StageState, StageTracker};
use crate::errors::ProvisionError;
use crate::events::EventType;
use crate::observability::StageSpanAttributes;
use crate::stages::{Stage, StageResult};

/// Runs pipelines in reverse with destructive intent.
#[derive(Debug, Clone)]
pub struct ResetEngine {
    runtime: Runtime,
    convergence: PollBudget,
    teardown_policy: RetryPolicy,
}

impl ResetEngine {
    /// Creates a reset engine with the default convergence budget.
    #[must_use]
    pub fn new(runtime: Runtime) -> Self {
        Self {
            runtime,
            convergence: PollBudget::default(),
            teardown_policy: RetryPolicy::default(),
        }
    }

    /// Sets how long to wait for a torn-down stage to report absent.
    #[must_use]
    pub fn with_convergence(mut self, budget: PollBudget) -> Self {
        self.convergence = budget;
        self
    }

    /// Sets the retry policy for individual teardown calls.
    #[must_use]
    pub fn with_teardown_policy(mut self, policy: RetryPolicy) -> Self {
        self.teardown_policy = policy;
        self
    }

    /// Replaces the runtime, keeping the budgets.
    #[must_use]
    pub fn with_runtime(mut self, runtime: Runtime) -> Self {
        self.runtime = runtime;
        self
    }

    /// Resets a pipeline, stopping at the first stage that cannot be removed
    /// or at the first stage boundary after cancellation.
    pub async fn reset(&self, pipeline: &Pipeline) -> ResetReport {
        let session = self.runtime.open(pipeline.name(), RunMode::Reset);
        let span = session.span_attributes(pipeline.len()).span();
        self.reset_stages(&session, pipeline).instrument(span).await
    }

    async fn reset_stages(&self, session: &RunSession, pipeline: &Pipeline) -> ResetReport {
        let mut report = ResetReport::start(session.identity());
        info!(stages = pipeline.len(), "Reset started");
        let order: Vec<String> = pipeline.stage_names().into_iter().rev().collect();
        session
            .emit(
                EventType::PipelineStarted,
                None,
                json!({ "mode": RunMode::Reset, "stages": order }),
            )
            .await;

        for (index, stage) in pipeline.stages().iter().rev().enumerate() {
            if let Err(err) = session.cancel_token().checkpoint() {
                warn!(stage = %stage.name(), error = %err, "Reset cancelled at stage boundary");
                report.mark_cancelled();
                report.stop_before(order[index..].iter().cloned());
                session
                    .emit(
                        EventType::PipelineCancelled,
                        Some(stage.name()),
                        json!({ "reason": err.to_string() }),
                    )
                    .await;
                break;
            }

            let span = StageSpanAttributes::new(stage.name())
                .with_kind(stage.kind())
                .span();
            let result = self
                .remove(session, &**stage)
                .instrument(span)
                .await;

            let removed = result.is_success();
            report.record(result);
            if !removed {
                report.stop_before(order[index + 1..].iter().cloned());
                break;
            }
        }

        report.finish();
        session
            .emit(
                EventType::PipelineCompleted,
                None,
                json!({
                    "success": report.is_success(),
                    "exit_code": report.exit_code(),
                    "duration_ms": report.duration_ms,
                }),
            )
            .await;
        if report.is_success() {
            info!(duration_ms = report.duration_ms, "{}", report.summary());
        } else {
            warn!(duration_ms = report.duration_ms, "{}", report.summary());
        }
        report
    }

    async fn remove(&self, session: &RunSession, stage: &dyn Stage) -> StageResult {
        let started_at = Utc::now();
        let mut tracker = StageTracker::new();
        let mut attempts = 0u32;
        session
            .emit(EventType::StageStarted, Some(stage.name()), json!({ "kind": stage.kind() }))
            .await;

        let outcome: Result<(), ProvisionError> = async {
            match stage.is_absent(session.read()).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(err) if err.is_retryable() => {
                    warn!(stage = %stage.name(), error = %err, "Absence check inconclusive, tearing down");
                }
                Err(err) => return Err(err),
            }

            for secret in stage.teardown_secrets() {
                session.read().credentials().resolve(&secret).await?;
            }

            tracker.transition(StageState::Applying);
            let teardown = with_retry(
                &self.teardown_policy,
                stage.name(),
                ProvisionError::is_retryable,
                || {
                    attempts += 1;
                    stage.teardown(session.stage())
                },
            )
            .await;
            match teardown {
                Ok(()) => {}
                Err(err) if err.is_retryable() => {
                    warn!(
                        stage = %stage.name(),
                        attempts,
                        error = %err,
                        "Teardown still failing, waiting for convergence"
                    );
                }
                Err(err) => return Err(err),
            }

            let what = format!("{} absent", stage.name());
            super::wait_until(&what, self.convergence, || stage.is_absent(session.read())).await?;
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) if attempts == 0 => {
                tracker.transition(StageState::Skipped);
                info!(stage = %stage.name(), "Already absent");
                session
                    .emit(EventType::StageAlreadyAbsent, Some(stage.name()), json!({}))
                    .await;
                StageResult::new(stage.name(), stage.kind(), StageOutcome::Skipped, started_at)
                    .with_transitions(tracker.history().to_vec())
                    .with_detail("already absent")
            }
            Ok(()) => {
                tracker.transition(StageState::Succeeded);
                info!(stage = %stage.name(), attempts, "Removed");
                session
                    .emit(
                        EventType::StageRemoved,
                        Some(stage.name()),
                        json!({ "attempts": attempts }),
                    )
                    .await;
                let outcome = if attempts > 1 {
                    StageOutcome::Retried
                } else {
                    StageOutcome::Succeeded
                };
                StageResult::new(stage.name(), stage.kind(), outcome, started_at)
                    .with_attempts(attempts)
                    .with_transitions(tracker.history().to_vec())
                    .with_detail("removed")
            }
            Err(err) => {
                tracker.transition(StageState::Failed);
                warn!(stage = %stage.name(), attempts, kind = %err.kind(), error = %err, "Teardown failed");
                session
                    .emit(
                        EventType::StageFailed,
                        Some(stage.name()),
                        json!({ "kind": err.kind(), "error": err.to_string(), "attempts": attempts }),
                    )
                    .await;
                StageResult::new(stage.name(), stage.kind(), StageOutcome::Failed, started_at)
                    .with_attempts(attempts)
                    .with_transitions(tracker.history().to_vec())
                    .with_error(&err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::pipeline::PipelineBuilder;
    use crate::testing::{CallLog, ScriptedStage, SimulatedEnvironment};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    fn engine() -> (ResetEngine, Arc<CollectingEventSink>) {
        let env = Arc::new(SimulatedEnvironment::new());
        let sink = Arc::new(CollectingEventSink::new());
        let runtime = Runtime::new(env.collaborators()).with_event_sink(sink.clone());
        let engine = ResetEngine::new(runtime)
            .with_convergence(PollBudget::new(Duration::from_millis(1), 5, Duration::from_secs(1)))
            .with_teardown_policy(
                RetryPolicy::new()
                    .with_max_attempts(3)
                    .with_base_delay_ms(1)
                    .with_max_delay_ms(2),
            );
        (engine, sink)
    }

    #[tokio::test]
    async fn test_reverse_order_and_absent_skip() {
        let (engine, sink) = engine();
        let log = CallLog::new();
        let pipeline = PipelineBuilder::new("test")
            .add(ScriptedStage::new("namespace", log.clone()).satisfied())
            .unwrap()
            .add(ScriptedStage::new("secret", log.clone()).after(["namespace"]))
            .unwrap()
            .add(ScriptedStage::new("database", log.clone()).after(["secret"]).satisfied())
            .unwrap()
            .build()
            .unwrap();

        let report = engine.reset(&pipeline).await;
        assert!(report.is_success());
        assert_eq!(
            report.outcomes(),
            vec![
                ("database".to_string(), StageOutcome::Succeeded),
                ("secret".to_string(), StageOutcome::Skipped),
                ("namespace".to_string(), StageOutcome::Succeeded),
            ]
        );
        assert_eq!(log.calls_of("teardown"), vec!["database:teardown", "namespace:teardown"]);
        assert!(log.calls_of("verify").is_empty());
        assert_eq!(
            sink.for_stage("secret"),
            vec![EventType::StageStarted, EventType::StageAlreadyAbsent]
        );

        let again = engine.reset(&pipeline).await;
        assert!(again.all_skipped());
        assert_eq!(again.total_attempts(), 0);
    }

    #[tokio::test]
    async fn test_transient_teardown_failures_converge() {
        let (engine, _) = engine();
        let log = CallLog::new();
        let pipeline = PipelineBuilder::new("test")
            .add(ScriptedStage::new("namespace", log.clone()).satisfied().failing_teardown(2))
            .unwrap()
            .build()
            .unwrap();

        let report = engine.reset(&pipeline).await;
        let result = report.result("namespace").unwrap();
        assert_eq!(result.outcome, StageOutcome::Retried);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.detail.as_deref(), Some("removed"));
    }

    #[tokio::test]
    async fn test_stuck_teardown_fails_and_stops() {
        let (engine, _) = engine();
        let log = CallLog::new();
        let pipeline = PipelineBuilder::new("test")
            .add(ScriptedStage::new("namespace", log.clone()).satisfied())
            .unwrap()
            .add(
                ScriptedStage::new("database", log.clone())
                    .after(["namespace"])
                    .satisfied()
                    .failing_teardown(10),
            )
            .unwrap()
            .build()
            .unwrap();

        let report = engine.reset(&pipeline).await;
        assert!(!report.is_success());
        assert_eq!(report.outcome("database"), Some(StageOutcome::Failed));
        assert_eq!(report.not_attempted, vec!["namespace"]);
        assert_eq!(
            report.first_failure.unwrap().kind,
            crate::errors::ErrorKind::TimeoutExceeded
        );
        assert_eq!(log.count("namespace", "teardown"), 0);
    }

    #[tokio::test]
    async fn test_cancellation_stops_at_next_boundary() {
        let (engine, sink) = engine();
        let log = CallLog::new();
        let pipeline = PipelineBuilder::new("test")
            .add(ScriptedStage::new("namespace", log.clone()).satisfied())
            .unwrap()
            .add(ScriptedStage::new("release", log.clone()).after(["namespace"]).satisfied())
            .unwrap()
            .add(
                ScriptedStage::new("rollout", log.clone())
                    .after(["release"])
                    .satisfied()
                    .interrupting(),
            )
            .unwrap()
            .build()
            .unwrap();

        let report = engine.reset(&pipeline).await;
        assert!(report.cancelled);
        assert!(!report.is_success());
        assert_eq!(report.outcome("rollout"), Some(StageOutcome::Succeeded));
        assert_eq!(report.not_attempted, vec!["release", "namespace"]);
        assert_eq!(report.exit_code(), crate::pipeline::EXIT_CANCELLED);
        assert_eq!(log.calls_of("teardown"), vec!["rollout:teardown"]);
        assert_eq!(sink.for_stage("release"), vec![EventType::PipelineCancelled]);
    }
}
