//! Scripted stages for orchestrator and reset tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::context::{ProbeContext, StageContext};
use crate::credentials::SecretRef;
use crate::errors::{CollaboratorError, ProvisionError};
use crate::pipeline::RetryPolicy;
use crate::stages::{ApplyMode, Condition, Stage};

/// Ordered record of stage calls shared by several scripted stages.
#[derive(Debug, Default)]
pub struct CallLog {
    calls: Mutex<Vec<String>>,
}

impl CallLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, stage: &str, call: &str) {
        self.calls.lock().push(format!("{stage}:{call}"));
    }

    /// Returns every call, as `stage:call`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Returns the calls of one kind, as `stage:call`.
    #[must_use]
    pub fn calls_of(&self, call: &str) -> Vec<String> {
        let suffix = format!(":{call}");
        self.calls
            .lock()
            .iter()
            .filter(|c| c.ends_with(&suffix))
            .cloned()
            .collect()
    }

    /// Counts the calls of one stage and kind.
    #[must_use]
    pub fn count(&self, stage: &str, call: &str) -> usize {
        let entry = format!("{stage}:{call}");
        self.calls.lock().iter().filter(|c| **c == entry).count()
    }

    /// Forgets all calls.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

/// What one `apply` invocation of a [`ScriptedStage`] does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyStep {
    /// The effect takes hold.
    Succeed,
    /// The action fails with a transient error.
    Fail,
    /// The action returns success but the effect does not take hold.
    NoEffect,
    /// The action is rejected with a structural error.
    Reject,
    /// The action sleeps before taking effect.
    Slow(Duration),
    /// The action waits out its budget, then reports its own timeout.
    GiveUpAtBudget,
}

#[derive(Debug)]
struct ScriptState {
    precondition: Condition,
    satisfied: bool,
    absent: bool,
    steps: VecDeque<ApplyStep>,
    teardown_failures: u32,
    interrupts: bool,
}

/// A stage whose live state is a pair of flags and whose `apply` follows a
/// script. Once the script is exhausted every apply succeeds.
#[derive(Debug)]
pub struct ScriptedStage {
    name: String,
    depends_on: Vec<String>,
    policy: RetryPolicy,
    secrets: Vec<SecretRef>,
    log: Arc<CallLog>,
    state: Mutex<ScriptState>,
}

impl ScriptedStage {
    /// Creates an unsatisfied, absent stage with a single-attempt policy.
    #[must_use]
    pub fn new(name: impl Into<String>, log: Arc<CallLog>) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            policy: RetryPolicy::once(),
            secrets: Vec::new(),
            log,
            state: Mutex::new(ScriptState {
                precondition: Condition::Met,
                satisfied: false,
                absent: true,
                steps: VecDeque::new(),
                teardown_failures: 0,
                interrupts: false,
            }),
        }
    }

    /// Declares dependencies.
    #[must_use]
    pub fn after(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on.extend(names.into_iter().map(Into::into));
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Requires a secret before apply.
    #[must_use]
    pub fn requiring(mut self, secret: SecretRef) -> Self {
        self.secrets.push(secret);
        self
    }

    /// Starts with the effect already in place.
    #[must_use]
    pub fn satisfied(self) -> Self {
        {
            let mut state = self.state.lock();
            state.satisfied = true;
            state.absent = false;
        }
        self
    }

    /// Starts with an unmet precondition.
    #[must_use]
    pub fn unmet(self, reason: &str) -> Self {
        self.state.lock().precondition = Condition::unmet(reason);
        self
    }

    /// Sets the apply script.
    #[must_use]
    pub fn script(self, steps: impl IntoIterator<Item = ApplyStep>) -> Self {
        self.state.lock().steps = steps.into_iter().collect();
        self
    }

    /// Fails the next `times` teardowns with a transient error.
    #[must_use]
    pub fn failing_teardown(self, times: u32) -> Self {
        self.state.lock().teardown_failures = times;
        self
    }

    /// Cancels the run once its own `apply` or `teardown` completes, as an
    /// operator interrupt arriving mid-stage would.
    #[must_use]
    pub fn interrupting(self) -> Self {
        self.state.lock().interrupts = true;
        self
    }

    /// Returns how many times `apply` ran, fallback included.
    #[must_use]
    pub fn apply_count(&self) -> usize {
        self.log.count(&self.name, "apply") + self.log.count(&self.name, "fallback")
    }

    fn take_effect(&self, ctx: &StageContext) {
        let interrupts = {
            let mut state = self.state.lock();
            state.satisfied = true;
            state.absent = false;
            state.interrupts
        };
        if interrupts {
            ctx.cancel_token().cancel("interrupted");
        }
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.policy.clone()
    }

    fn required_secrets(&self) -> Vec<SecretRef> {
        self.secrets.clone()
    }

    async fn precondition(&self, _ctx: &ProbeContext) -> Result<Condition, ProvisionError> {
        self.log.push(&self.name, "precondition");
        Ok(self.state.lock().precondition.clone())
    }

    async fn is_satisfied(&self, _ctx: &ProbeContext) -> Result<bool, ProvisionError> {
        self.log.push(&self.name, "is_satisfied");
        Ok(self.state.lock().satisfied)
    }

    async fn apply(&self, ctx: &StageContext, mode: ApplyMode) -> Result<(), ProvisionError> {
        self.log
            .push(&self.name, if mode.is_fallback() { "fallback" } else { "apply" });
        let step = self.state.lock().steps.pop_front().unwrap_or(ApplyStep::Succeed);
        match step {
            ApplyStep::Succeed => {
                self.take_effect(ctx);
                Ok(())
            }
            ApplyStep::Fail => Err(ProvisionError::apply_failed(&self.name, "scripted failure")),
            ApplyStep::NoEffect => Ok(()),
            ApplyStep::Reject => {
                Err(CollaboratorError::rejected("scripted", "structurally impossible").into())
            }
            ApplyStep::GiveUpAtBudget => {
                tokio::time::sleep(mode.timeout()).await;
                Err(CollaboratorError::timeout("scripted", "tool deadline reached").into())
            }
            ApplyStep::Slow(delay) => {
                tokio::time::sleep(delay).await;
                self.take_effect(ctx);
                Ok(())
            }
        }
    }

    async fn verify(&self, _ctx: &ProbeContext) -> Result<Condition, ProvisionError> {
        self.log.push(&self.name, "verify");
        if self.state.lock().satisfied {
            Ok(Condition::Met)
        } else {
            Ok(Condition::unmet(format!("{} has no effect", self.name)))
        }
    }

    async fn is_absent(&self, _ctx: &ProbeContext) -> Result<bool, ProvisionError> {
        self.log.push(&self.name, "is_absent");
        Ok(self.state.lock().absent)
    }

    async fn teardown(&self, ctx: &StageContext) -> Result<(), ProvisionError> {
        self.log.push(&self.name, "teardown");
        let interrupts = {
            let mut state = self.state.lock();
            if state.teardown_failures > 0 {
                state.teardown_failures -= 1;
                return Err(CollaboratorError::transient("scripted", "still terminating").into());
            }
            state.absent = true;
            state.satisfied = false;
            state.interrupts
        };
        if interrupts {
            ctx.cancel_token().cancel("interrupted");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SimulatedEnvironment, TestHarness};

    #[tokio::test]
    async fn test_script_then_default_success() {
        let log = CallLog::new();
        let stage = ScriptedStage::new("release", log.clone()).script([ApplyStep::Fail, ApplyStep::NoEffect]);
        let harness = TestHarness::new(Arc::new(SimulatedEnvironment::new()));

        assert!(stage.apply(harness.stage(), harness.primary()).await.is_err());
        stage.apply(harness.stage(), harness.primary()).await.unwrap();
        assert!(!stage.verify(harness.read()).await.unwrap().is_met());
        stage.apply(harness.stage(), harness.fallback()).await.unwrap();
        assert!(stage.verify(harness.read()).await.unwrap().is_met());

        assert_eq!(stage.apply_count(), 3);
        assert_eq!(log.calls_of("fallback"), vec!["release:fallback"]);
    }

    #[tokio::test]
    async fn test_teardown_failures() {
        let log = CallLog::new();
        let stage = ScriptedStage::new("database", log).satisfied().failing_teardown(1);
        let harness = TestHarness::new(Arc::new(SimulatedEnvironment::new()));

        assert!(!stage.is_absent(harness.read()).await.unwrap());
        assert!(stage.teardown(harness.stage()).await.unwrap_err().is_retryable());
        stage.teardown(harness.stage()).await.unwrap();
        assert!(stage.is_absent(harness.read()).await.unwrap());
    }
}
