//! Workload rollout stage.

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::{ApplyMode, Condition, Stage, StageBase, StageBaseExt};
use crate::context::{ProbeContext, StageContext};
use crate::core::{ReadinessRule, ResourceRef, StageKind};
use crate::errors::ProvisionError;
use crate::pipeline::{wait_until, PollBudget, RetryPolicy};
use crate::ports::CONFIG_HASH_ANNOTATION;
use crate::probe::{fatal_log_line, StateProbe};

/// Log lines inspected when a rollout crash-loops.
const CRASH_LOG_TAIL: usize = 50;

/// Restarts a workload so it picks up new configuration, then waits for it
/// to become available.
///
/// The restart stamps a digest of the config sources on the pod template.
/// The stage is satisfied only while the workload is available and that
/// digest matches the sources' current content, so rewritten configuration
/// always triggers a restart.
#[derive(Debug, Clone)]
pub struct RolloutStage {
    base: StageBase,
    namespace: String,
    workload: String,
    min_ready: u32,
    poll: PollBudget,
    config_sources: Vec<ResourceRef>,
}

impl RolloutStage {
    /// Creates a rollout stage.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        workload: impl Into<String>,
        poll: PollBudget,
    ) -> Self {
        let namespace = namespace.into();
        let workload = workload.into();
        let mut base = StageBase::new(name);
        base.add_prerequisite(
            ResourceRef::workload(namespace.clone(), workload.clone()),
            ReadinessRule::Exists,
        );
        Self {
            base,
            namespace,
            workload,
            min_ready: 1,
            poll,
            config_sources: Vec::new(),
        }
    }

    /// Adds a config map or secret the workload reads at start-up.
    #[must_use]
    pub fn with_config_source(mut self, reference: ResourceRef) -> Self {
        self.config_sources.push(reference);
        self
    }

    /// Digest of the config sources' live content, or `None` without sources.
    async fn config_digest(&self, probe: &dyn StateProbe) -> Result<Option<String>, ProvisionError> {
        if self.config_sources.is_empty() {
            return Ok(None);
        }
        let mut hasher = Sha256::new();
        for reference in &self.config_sources {
            hasher.update(reference.to_string().as_bytes());
            hasher.update([0]);
            match probe.get(reference).await? {
                Some(resource) => {
                    for (key, value) in &resource.data {
                        hasher.update(key.as_bytes());
                        hasher.update([b'=']);
                        hasher.update(value.as_bytes());
                        hasher.update([0]);
                    }
                }
                None => hasher.update(b"absent"),
            }
            hasher.update([0xff]);
        }
        Ok(Some(hex::encode(hasher.finalize())))
    }

    /// Checks that the running pods were started with the current config.
    async fn runs_current_config(&self, probe: &dyn StateProbe) -> Result<Condition, ProvisionError> {
        let Some(expected) = self.config_digest(probe).await? else {
            return Ok(Condition::Met);
        };
        let stamped = probe
            .get(&self.reference())
            .await?
            .and_then(|resource| resource.data.get(CONFIG_HASH_ANNOTATION).cloned());
        if stamped.as_deref() == Some(expected.as_str()) {
            Ok(Condition::Met)
        } else {
            Ok(Condition::unmet(format!(
                "{} was not restarted with the current configuration",
                self.reference()
            )))
        }
    }

    fn reference(&self) -> ResourceRef {
        ResourceRef::workload(self.namespace.clone(), self.workload.clone())
    }

    fn rule(&self) -> ReadinessRule {
        ReadinessRule::WorkloadAvailable {
            min_ready: self.min_ready,
        }
    }

    async fn crash_detail(&self, ctx: &StageContext, signature: &str) -> String {
        let lines = ctx
            .cluster()
            .logs(&self.namespace, &self.workload, CRASH_LOG_TAIL)
            .await
            .unwrap_or_default();
        match fatal_log_line(&lines) {
            Some(line) => format!("{} is crash-looping ({signature}): {line}", self.reference()),
            None => format!("{} is crash-looping ({signature})", self.reference()),
        }
    }
}

impl StageBaseExt for RolloutStage {
    fn base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }
}

#[async_trait]
impl Stage for RolloutStage {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn kind(&self) -> StageKind {
        StageKind::Rollout
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
        if !ctx.probe().is_ready(&self.reference(), &self.rule()).await? {
            return Ok(false);
        }
        Ok(self.runs_current_config(ctx.probe()).await?.is_met())
    }

    async fn apply(&self, ctx: &StageContext, _mode: ApplyMode) -> Result<(), ProvisionError> {
        let annotations: BTreeMap<String, String> = self
            .config_digest(ctx.probe())
            .await?
            .map(|digest| (CONFIG_HASH_ANNOTATION.to_string(), digest))
            .into_iter()
            .collect();
        ctx.cluster()
            .restart_rollout(&self.namespace, &self.workload, &annotations)
            .await?;

        let reference = self.reference();
        let rule = self.rule();
        let crashed: Mutex<Option<String>> = Mutex::new(None);
        let waited = wait_until("workload available", self.poll, || {
            let reference = &reference;
            let rule = &rule;
            let crashed = &crashed;
            async move {
                let status = ctx
                    .probe()
                    .get(reference)
                    .await?
                    .and_then(|resource| resource.workload);
                if let Some(signature) = status.as_ref().and_then(|s| s.crash_signature()) {
                    *crashed.lock() = Some(signature.to_string());
                    return Ok(true);
                }
                ctx.probe().is_ready(reference, rule).await
            }
        })
        .await?;

        if let Some(signature) = crashed.into_inner() {
            let detail = self.crash_detail(ctx, &signature).await;
            warn!(workload = %reference, signature = %signature, "Rollout crash-looping");
            return Err(ProvisionError::apply_failed(self.name(), detail));
        }
        info!(workload = %reference, polls = waited, "Rollout available");
        Ok(())
    }

    async fn verify(&self, ctx: &ProbeContext) -> Result<Condition, ProvisionError> {
        match Condition::require(ctx, &self.reference(), &self.rule()).await? {
            Condition::Met => self.runs_current_config(ctx.probe()).await,
            unmet => Ok(unmet),
        }
    }

    async fn is_absent(&self, ctx: &ProbeContext) -> Result<bool, ProvisionError> {
        Ok(ctx
            .probe()
            .get(&self.reference())
            .await?
            .and_then(|resource| resource.workload)
            .map_or(true, |status| status.desired_replicas == 0))
    }

    async fn teardown(&self, ctx: &StageContext) -> Result<(), ProvisionError> {
        ctx.cluster().scale(&self.namespace, &self.workload, 0).await?;
        info!(workload = %self.reference(), "Scaled workload to zero");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SimulatedEnvironment, TestHarness};
    use std::sync::Arc;
    use std::time::Duration;

    fn stage() -> RolloutStage {
        RolloutStage::new(
            "registration-rollout",
            "demo",
            "demo-registration-service",
            PollBudget::new(Duration::from_millis(1), 5, Duration::from_secs(1)),
        )
    }

    #[tokio::test]
    async fn test_precondition_requires_workload() {
        let env = Arc::new(SimulatedEnvironment::new());
        env.seed_namespace("demo");
        let harness = TestHarness::new(env.clone());
        let condition = stage().precondition(harness.read()).await.unwrap();
        assert_eq!(
            condition,
            Condition::unmet("deployment/demo/demo-registration-service is not present")
        );
    }

    #[tokio::test]
    async fn test_restart_and_wait() {
        let env = Arc::new(SimulatedEnvironment::new());
        env.seed_namespace("demo");
        env.seed_workload("demo", "demo-registration-service", 1);
        let harness = TestHarness::new(env.clone());

        stage().apply(harness.stage(), harness.primary()).await.unwrap();
        assert!(stage().verify(harness.read()).await.unwrap().is_met());
        assert_eq!(
            env.mutations(),
            vec!["cluster restart deployment/demo/demo-registration-service"]
        );
    }

    fn configured_stage() -> RolloutStage {
        stage()
            .with_config_source(ResourceRef::config_map("demo", "demo-registration-service-config"))
            .with_config_source(ResourceRef::secret("demo", "demo-registration-service-secret"))
    }

    #[tokio::test]
    async fn test_available_workload_without_sources_is_satisfied() {
        let env = Arc::new(SimulatedEnvironment::new());
        env.seed_namespace("demo");
        env.seed_workload("demo", "demo-registration-service", 1);
        let harness = TestHarness::new(env.clone());

        assert!(stage().is_satisfied(harness.read()).await.unwrap());
    }

    #[tokio::test]
    async fn test_changed_config_requires_restart() {
        let env = Arc::new(SimulatedEnvironment::new());
        env.seed_namespace("demo");
        env.seed_workload("demo", "demo-registration-service", 1);
        env.seed_secret("demo", "demo-registration-service-secret", &[("SPRING_DATASOURCE_PASSWORD", "first")]);
        let stage = configured_stage();

        let harness = TestHarness::new(env.clone());
        assert!(!stage.is_satisfied(harness.read()).await.unwrap());
        stage.apply(harness.stage(), harness.primary()).await.unwrap();
        assert!(stage.verify(harness.read()).await.unwrap().is_met());
        assert!(stage.is_satisfied(TestHarness::new(env.clone()).read()).await.unwrap());

        env.seed_secret("demo", "demo-registration-service-secret", &[("SPRING_DATASOURCE_PASSWORD", "second")]);
        env.clear_mutations();
        let harness = TestHarness::new(env.clone());
        assert!(!stage.is_satisfied(harness.read()).await.unwrap());
        stage.apply(harness.stage(), harness.primary()).await.unwrap();
        assert!(stage.is_satisfied(TestHarness::new(env.clone()).read()).await.unwrap());
        assert_eq!(
            env.mutations(),
            vec!["cluster restart deployment/demo/demo-registration-service"]
        );
    }

    #[tokio::test]
    async fn test_crash_loop_fails_fast_with_log_line() {
        let env = Arc::new(SimulatedEnvironment::new());
        env.seed_namespace("demo");
        env.seed_workload("demo", "demo-registration-service", 1);
        env.set_crash_loop("demo", "demo-registration-service", "CrashLoopBackOff");
        env.set_logs(
            "demo",
            "demo-registration-service",
            vec!["FATAL: password authentication failed".to_string()],
        );
        let harness = TestHarness::new(env.clone());

        let err = stage().apply(harness.stage(), harness.primary()).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("CrashLoopBackOff"));
        assert!(message.contains("password authentication failed"));
    }

    #[tokio::test]
    async fn test_scale_down_counts_as_absent() {
        let env = Arc::new(SimulatedEnvironment::new());
        env.seed_namespace("demo");
        env.seed_workload("demo", "demo-registration-service", 1);
        let harness = TestHarness::new(env.clone());

        assert!(!stage().is_absent(harness.read()).await.unwrap());
        stage().teardown(harness.stage()).await.unwrap();
        assert!(stage().is_absent(harness.read()).await.unwrap());
    }
}
