//! End-of-pipeline readiness verification.

use async_trait::async_trait;
use futures::future::try_join_all;
use std::fmt;
use tracing::info;

use super::{ApplyMode, Condition, Stage, StageBase, StageBaseExt};
use crate::context::{ProbeContext, StageContext};
use crate::core::{ReadinessRule, ResourceRef, StageKind};
use crate::errors::ProvisionError;
use crate::pipeline::{wait_until, PollBudget, RetryPolicy};

/// One resource that must satisfy one readiness rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessCheck {
    /// The resource.
    pub reference: ResourceRef,
    /// The rule it must satisfy.
    pub rule: ReadinessRule,
}

impl ReadinessCheck {
    /// Creates a check.
    #[must_use]
    pub fn new(reference: ResourceRef, rule: ReadinessRule) -> Self {
        Self { reference, rule }
    }

    async fn evaluate(&self, ctx: &ProbeContext) -> Result<Condition, ProvisionError> {
        Condition::require(ctx, &self.reference, &self.rule).await
    }
}

impl fmt::Display for ReadinessCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is {}", self.reference, self.rule)
    }
}

/// Waits until every readiness check holds.
///
/// Has no destructive counterpart.
#[derive(Debug, Clone)]
pub struct VerificationStage {
    base: StageBase,
    checks: Vec<ReadinessCheck>,
    poll: PollBudget,
}

impl VerificationStage {
    /// Creates a verification stage with no checks.
    #[must_use]
    pub fn new(name: impl Into<String>, poll: PollBudget) -> Self {
        Self {
            base: StageBase::new(name),
            checks: Vec::new(),
            poll,
        }
    }

    /// Adds a check.
    #[must_use]
    pub fn check(mut self, reference: ResourceRef, rule: ReadinessRule) -> Self {
        self.checks.push(ReadinessCheck::new(reference, rule));
        self
    }

    /// Returns the checks.
    #[must_use]
    pub fn checks(&self) -> &[ReadinessCheck] {
        &self.checks
    }

    async fn evaluate(&self, ctx: &ProbeContext) -> Result<Condition, ProvisionError> {
        let conditions = try_join_all(self.checks.iter().map(|check| check.evaluate(ctx))).await?;
        Ok(Condition::all(conditions))
    }
}

impl StageBaseExt for VerificationStage {
    fn base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }
}

#[async_trait]
impl Stage for VerificationStage {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn kind(&self) -> StageKind {
        StageKind::Verification
    }

    fn depends_on(&self) -> &[String] {
        self.base.depends_on()
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.base.retry().clone()
    }

    async fn precondition(&self, ctx: &ProbeContext) -> Result<Condition, ProvisionError> {
        self.base.check_prerequisites(ctx).await
    }

    async fn is_satisfied(&self, ctx: &ProbeContext) -> Result<bool, ProvisionError> {
        Ok(self.evaluate(ctx).await?.is_met())
    }

    async fn apply(&self, ctx: &StageContext, _mode: ApplyMode) -> Result<(), ProvisionError> {
        let polls = wait_until("readiness checks", self.poll, || async {
            Ok(self.evaluate(ctx.read_only()).await?.is_met())
        })
        .await?;
        info!(stage = %self.name(), checks = self.checks.len(), polls, "Readiness checks hold");
        Ok(())
    }

    async fn verify(&self, ctx: &ProbeContext) -> Result<Condition, ProvisionError> {
        self.evaluate(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::Identifier;
    use crate::testing::{SimulatedEnvironment, TestHarness};
    use std::sync::Arc;
    use std::time::Duration;

    fn stage() -> VerificationStage {
        VerificationStage::new(
            "verify",
            PollBudget::new(Duration::from_millis(1), 3, Duration::from_secs(1)),
        )
        .check(
            ResourceRef::workload("demo", "demo-registration-service"),
            ReadinessRule::WorkloadAvailable { min_ready: 1 },
        )
        .check(
            ResourceRef::Table {
                database: Identifier::new("demo_rs").unwrap(),
                schema: Identifier::new("public").unwrap(),
                name: Identifier::new("edc_participant").unwrap(),
            },
            ReadinessRule::Exists,
        )
    }

    #[test]
    fn test_check_display() {
        let check = ReadinessCheck::new(ResourceRef::namespace("demo"), ReadinessRule::NamespaceActive);
        assert_eq!(check.to_string(), "namespace/demo is active");
    }

    #[tokio::test]
    async fn test_reports_first_unmet_check() {
        let env = Arc::new(SimulatedEnvironment::new());
        env.seed_postgres(&SimulatedEnvironment::default_access(), "admin-pw");
        env.seed_namespace("demo");
        env.seed_workload("demo", "demo-registration-service", 1);
        env.seed_role("demo_rsusr", "pw");
        env.seed_database("demo_rs", "demo_rsusr");
        let harness = TestHarness::new(env.clone());

        let condition = stage().verify(harness.read()).await.unwrap();
        assert_eq!(
            condition,
            Condition::unmet("table/demo_rs/public.edc_participant is not present")
        );
        let err = stage().apply(harness.stage(), harness.primary()).await.unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::TimeoutExceeded);

        env.seed_table("demo_rs", "public", "edc_participant");
        assert!(stage().is_satisfied(harness.read()).await.unwrap());
        assert!(stage().is_absent(harness.read()).await.unwrap());
    }
}
