//! The provisioning state machine.
//!
//! Stages run strictly in pipeline order, one at a time. For each stage the
//! orchestrator evaluates the precondition, then the idempotence check, then
//! resolves the stage's secrets and drives `apply` + `verify` through the
//! retry tier and, if configured, a single fallback attempt. The first stage
//! that does not succeed or skip ends the run.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashSet;
use tracing::{debug, info, warn, Instrument};

use super::{Pipeline, PipelineReport, RetryState, RunSession, Runtime};
use crate::context::RunMode;
use crate::core::{StageOutcome, StageState, StageTracker};
use crate::errors::ProvisionError;
use crate::events::EventType;
use crate::observability::StageSpanAttributes;
use crate::stages::{ApplyMode, Condition, Stage, StageResult};

/// Runs provisioning pipelines.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    runtime: Runtime,
}

impl Orchestrator {
    /// Creates an orchestrator over a runtime.
    #[must_use]
    pub fn new(runtime: Runtime) -> Self {
        Self { runtime }
    }

    /// Returns the runtime.
    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Runs a pipeline to completion, to its first failure, or to the first
    /// stage boundary after cancellation.
    pub async fn run(&self, pipeline: &Pipeline) -> PipelineReport {
        let session = self.runtime.open(pipeline.name(), RunMode::Provision);
        let span = session.span_attributes(pipeline.len()).span();
        run_stages(&session, pipeline).instrument(span).await
    }
}

async fn run_stages(session: &RunSession, pipeline: &Pipeline) -> PipelineReport {
    let mut report = PipelineReport::start(session.identity());
    info!(stages = pipeline.len(), "Provisioning started");
    session
        .emit(
            EventType::PipelineStarted,
            None,
            json!({ "mode": RunMode::Provision, "stages": pipeline.stage_names() }),
        )
        .await;

    let stages = pipeline.stages();
    let mut completed: HashSet<&str> = HashSet::new();

    for (index, stage) in stages.iter().enumerate() {
        if let Err(err) = session.cancel_token().checkpoint() {
            warn!(stage = %stage.name(), error = %err, "Run cancelled at stage boundary");
            report.mark_cancelled();
            report.stop_before(stages[index..].iter().map(|s| s.name().to_string()));
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
        let result = evaluate(session, &**stage, &completed)
            .instrument(span)
            .await;

        let succeeded = result.is_success();
        report.record(result);
        if !succeeded {
            report.stop_before(stages[index + 1..].iter().map(|s| s.name().to_string()));
            break;
        }
        completed.insert(stage.name());
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

/// Bookkeeping for one stage within one run.
struct Evaluation<'a> {
    session: &'a RunSession,
    stage: &'a dyn Stage,
    tracker: StageTracker,
    started_at: DateTime<Utc>,
    attempts: u32,
    fallback_used: bool,
}

impl<'a> Evaluation<'a> {
    fn new(session: &'a RunSession, stage: &'a dyn Stage) -> Self {
        Self {
            session,
            stage,
            tracker: StageTracker::new(),
            started_at: Utc::now(),
            attempts: 0,
            fallback_used: false,
        }
    }

    fn name(&self) -> &'a str {
        self.stage.name()
    }

    fn result(&self, outcome: StageOutcome) -> StageResult {
        StageResult::new(self.name(), self.stage.kind(), outcome, self.started_at)
            .with_attempts(self.attempts)
            .with_fallback_used(self.fallback_used)
            .with_transitions(self.tracker.history().to_vec())
    }

    async fn skipped(mut self) -> StageResult {
        self.tracker.transition(StageState::Skipped);
        info!(stage = %self.name(), "Already satisfied, skipping");
        self.session
            .emit(EventType::StageSkipped, Some(self.name()), json!({}))
            .await;
        self.result(StageOutcome::Skipped).with_detail("already satisfied")
    }

    async fn precondition_failed(mut self, condition: String) -> StageResult {
        self.tracker.transition(StageState::PreconditionFailed);
        let err = ProvisionError::precondition_failed(self.name(), condition);
        warn!(stage = %self.name(), error = %err, "Precondition not met");
        self.session
            .emit(
                EventType::StagePreconditionFailed,
                Some(self.name()),
                json!({ "error": err.to_string() }),
            )
            .await;
        self.result(StageOutcome::PreconditionFailed).with_error(&err)
    }

    async fn succeeded(mut self) -> StageResult {
        self.tracker.transition(StageState::Succeeded);
        let outcome = if self.attempts > 1 || self.fallback_used {
            StageOutcome::Retried
        } else {
            StageOutcome::Succeeded
        };
        info!(
            stage = %self.name(),
            attempts = self.attempts,
            fallback = self.fallback_used,
            "Stage succeeded"
        );
        self.session
            .emit(
                EventType::StageSucceeded,
                Some(self.name()),
                json!({ "attempts": self.attempts, "fallback_used": self.fallback_used }),
            )
            .await;
        self.result(outcome)
    }

    async fn failed(mut self, err: &ProvisionError) -> StageResult {
        self.tracker.transition(StageState::Failed);
        warn!(
            stage = %self.name(),
            attempts = self.attempts,
            fallback = self.fallback_used,
            kind = %err.kind(),
            error = %err,
            "Stage failed"
        );
        self.session
            .emit(
                EventType::StageFailed,
                Some(self.name()),
                json!({
                    "kind": err.kind(),
                    "error": err.to_string(),
                    "attempts": self.attempts,
                    "fallback_used": self.fallback_used,
                }),
            )
            .await;
        self.result(StageOutcome::Failed).with_error(err)
    }

    /// One `apply` followed by `verify`, bounded by the mode's deadline.
    async fn attempt(&mut self, mode: ApplyMode) -> Result<(), ProvisionError> {
        self.attempts += 1;
        let deadline = mode.deadline();
        debug!(stage = %self.name(), attempt = self.attempts, fallback = mode.is_fallback(), "Applying");
        tokio::time::timeout(deadline, self.stage.apply(self.session.stage(), mode))
            .await
            .map_err(|_| ProvisionError::timeout(format!("{} apply", self.name()), deadline))??;

        match self.stage.verify(self.session.read()).await? {
            Condition::Met => Ok(()),
            Condition::Unmet(reason) => Err(ProvisionError::verify_failed(self.name(), reason)),
        }
    }
}

async fn evaluate(session: &RunSession, stage: &dyn Stage, completed: &HashSet<&str>) -> StageResult {
    let mut eval = Evaluation::new(session, stage);
    session
        .emit(EventType::StageStarted, Some(stage.name()), json!({ "kind": stage.kind() }))
        .await;

    if let Some(dep) = stage.depends_on().iter().find(|d| !completed.contains(d.as_str())) {
        return eval
            .precondition_failed(format!("dependency {dep} has not completed"))
            .await;
    }

    match stage.precondition(session.read()).await {
        Ok(Condition::Met) => {}
        Ok(Condition::Unmet(condition)) => return eval.precondition_failed(condition).await,
        Err(err) => return eval.failed(&err).await,
    }

    match stage.is_satisfied(session.read()).await {
        Ok(true) => return eval.skipped().await,
        Ok(false) => {}
        Err(err) if err.is_retryable() => {
            warn!(stage = %stage.name(), error = %err, "Idempotence check inconclusive, applying");
        }
        Err(err) => return eval.failed(&err).await,
    }

    for secret in stage.required_secrets() {
        if let Err(err) = session.read().credentials().resolve(&secret).await {
            return eval.failed(&err).await;
        }
    }

    let policy = stage.retry_policy();
    let mut retry = RetryState::new();
    eval.tracker.transition(StageState::Applying);

    let primary = ApplyMode::Primary {
        timeout: policy.apply_timeout,
    };
    let last_error = loop {
        let err = match eval.attempt(primary).await {
            Ok(()) => return eval.succeeded().await,
            Err(err) => err,
        };
        if err.needs_other_strategy() && policy.fallback.is_some() {
            warn!(stage = %stage.name(), error = %err, "Primary strategy refused, not retrying it");
            break err;
        }
        if !err.is_retryable() {
            return eval.failed(&err).await;
        }
        if RetryState::is_exhausted(eval.attempts, &policy) {
            break err;
        }
        eval.tracker.transition(StageState::Retrying);
        let delay = retry.next_delay(&policy);
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        warn!(
            stage = %stage.name(),
            attempt = eval.attempts,
            delay_ms,
            error = %err,
            "Attempt failed, retrying"
        );
        session
            .emit(
                EventType::StageRetrying,
                Some(stage.name()),
                json!({ "attempt": eval.attempts, "delay_ms": delay_ms, "error": err.to_string() }),
            )
            .await;
        tokio::time::sleep(delay).await;
    };

    let Some(fallback) = policy.fallback else {
        return eval.failed(&last_error).await;
    };

    eval.tracker.transition(StageState::Retrying);
    eval.tracker.transition(StageState::FallbackApplying);
    eval.fallback_used = true;
    warn!(
        stage = %stage.name(),
        attempts = eval.attempts,
        timeout_secs = fallback.timeout.as_secs(),
        teardown_first = fallback.teardown_first,
        error = %last_error,
        "Primary strategy exhausted, falling back"
    );
    session
        .emit(
            EventType::StageFallback,
            Some(stage.name()),
            json!({
                "after_attempts": eval.attempts,
                "timeout_secs": fallback.timeout.as_secs(),
                "teardown_first": fallback.teardown_first,
                "error": last_error.to_string(),
            }),
        )
        .await;

    if fallback.teardown_first {
        if let Err(err) = stage.teardown(session.stage()).await {
            warn!(stage = %stage.name(), error = %err, "Teardown before fallback failed");
        }
    }

    match eval
        .attempt(ApplyMode::Fallback {
            timeout: fallback.timeout,
        })
        .await
    {
        Ok(()) => eval.succeeded().await,
        Err(err) => eval.failed(&err).await,
    }
}
