//! Cluster namespace stage.

use async_trait::async_trait;
use tracing::info;

use super::{ApplyMode, Condition, Stage, StageBase, StageBaseExt};
use crate::context::{ProbeContext, StageContext};
use crate::core::{ReadinessRule, ResourceRef, StageKind};
use crate::errors::ProvisionError;
use crate::pipeline::RetryPolicy;
use crate::ports::Manifest;

/// Ensures a namespace exists and is active.
///
/// Reset deletes the namespace. A namespace still terminating counts as
/// converging; the reset engine polls until it is gone.
#[derive(Debug, Clone)]
pub struct NamespaceStage {
    base: StageBase,
    namespace: String,
}

impl NamespaceStage {
    /// Creates a namespace stage.
    #[must_use]
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            base: StageBase::new(name),
            namespace: namespace.into(),
        }
    }

    fn reference(&self) -> ResourceRef {
        ResourceRef::namespace(self.namespace.clone())
    }
}

impl StageBaseExt for NamespaceStage {
    fn base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }
}

#[async_trait]
impl Stage for NamespaceStage {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn kind(&self) -> StageKind {
        StageKind::Namespace
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
        ctx.probe()
            .is_ready(&self.reference(), &ReadinessRule::NamespaceActive)
            .await
    }

    async fn apply(&self, ctx: &StageContext, _mode: ApplyMode) -> Result<(), ProvisionError> {
        info!(namespace = %self.namespace, "Creating namespace");
        ctx.cluster()
            .apply(&Manifest::Namespace {
                name: self.namespace.clone(),
            })
            .await?;
        Ok(())
    }

    async fn verify(&self, ctx: &ProbeContext) -> Result<Condition, ProvisionError> {
        Condition::require(ctx, &self.reference(), &ReadinessRule::NamespaceActive).await
    }

    async fn is_absent(&self, ctx: &ProbeContext) -> Result<bool, ProvisionError> {
        Ok(!ctx.probe().exists(&self.reference()).await?)
    }

    async fn teardown(&self, ctx: &StageContext) -> Result<(), ProvisionError> {
        let outcome = ctx.cluster().delete(&self.reference()).await?;
        info!(namespace = %self.namespace, ?outcome, "Deleted namespace");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SimulatedEnvironment, TestHarness};

    #[tokio::test]
    async fn test_namespace_lifecycle() {
        let env = std::sync::Arc::new(SimulatedEnvironment::new());
        let harness = TestHarness::new(env.clone());
        let stage = NamespaceStage::new("namespace", "demo");

        assert!(!stage.is_satisfied(harness.read()).await.unwrap());
        stage.apply(harness.stage(), harness.primary()).await.unwrap();
        assert!(stage.verify(harness.read()).await.unwrap().is_met());
        assert!(stage.is_satisfied(harness.read()).await.unwrap());

        assert!(!stage.is_absent(harness.read()).await.unwrap());
        stage.teardown(harness.stage()).await.unwrap();
        assert!(stage.is_absent(harness.read()).await.unwrap());
        assert_eq!(
            env.mutations(),
            vec!["cluster apply namespace/demo", "cluster delete namespace/demo"]
        );
    }
}
