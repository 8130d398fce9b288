//! Package release stage.

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{info, warn};

use super::{ApplyMode, Condition, Stage, StageBase, StageBaseExt};
use crate::context::{ProbeContext, StageContext};
use crate::core::{ReadinessRule, ResourceRef, StageKind};
use crate::errors::ProvisionError;
use crate::pipeline::RetryPolicy;
use crate::ports::{ReleaseInstall, RELEASE_INSTANCE_LABEL};

/// How many namespace events to log when an install fails.
const DIAGNOSTIC_EVENTS: usize = 20;

/// Installs or upgrades a release from a chart.
///
/// The primary strategy runs lifecycle hooks with the policy's apply
/// timeout. The fallback strategy skips hooks and uses the fallback timeout;
/// hooks are the part that hangs on resource-constrained clusters.
#[derive(Debug, Clone)]
pub struct ReleaseStage {
    base: StageBase,
    release: String,
    namespace: String,
    chart_dir: PathBuf,
    values_files: Vec<PathBuf>,
}

impl ReleaseStage {
    /// Creates a release stage.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        release: impl Into<String>,
        namespace: impl Into<String>,
        chart_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            base: StageBase::new(name),
            release: release.into(),
            namespace: namespace.into(),
            chart_dir: chart_dir.into(),
            values_files: Vec::new(),
        }
    }

    /// Adds a values file.
    #[must_use]
    pub fn with_values_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.values_files.push(path.into());
        self
    }

    /// Builds the install request for one apply attempt.
    #[must_use]
    pub fn install_request(&self, mode: ApplyMode) -> ReleaseInstall {
        self.values_files.iter().fold(
            ReleaseInstall::new(
                self.release.clone(),
                self.namespace.clone(),
                self.chart_dir.clone(),
            )
            .with_timeout(mode.timeout())
            .with_hooks(!mode.is_fallback()),
            |request, values| request.with_values_file(values.clone()),
        )
    }

    fn reference(&self) -> ResourceRef {
        ResourceRef::release(self.namespace.clone(), self.release.clone())
    }

    async fn log_diagnostics(&self, ctx: &StageContext) {
        match ctx.cluster().events(&self.namespace).await {
            Ok(events) => {
                for event in events.iter().rev().take(DIAGNOSTIC_EVENTS).rev() {
                    warn!(namespace = %self.namespace, event = %event, "Recent event");
                }
            }
            Err(err) => warn!(namespace = %self.namespace, error = %err, "Could not read events"),
        }
    }
}

impl StageBaseExt for ReleaseStage {
    fn base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }
}

#[async_trait]
impl Stage for ReleaseStage {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn kind(&self) -> StageKind {
        StageKind::Release
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
            .is_ready(&self.reference(), &ReadinessRule::ReleaseDeployed)
            .await
    }

    async fn apply(&self, ctx: &StageContext, mode: ApplyMode) -> Result<(), ProvisionError> {
        let request = self.install_request(mode);
        info!(
            release = %self.release,
            namespace = %self.namespace,
            hooks = request.hooks,
            timeout_secs = request.timeout.as_secs(),
            "Installing release"
        );
        if let Err(err) = ctx.releases().install(&request).await {
            self.log_diagnostics(ctx).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn verify(&self, ctx: &ProbeContext) -> Result<Condition, ProvisionError> {
        Condition::require(ctx, &self.reference(), &ReadinessRule::ReleaseDeployed).await
    }

    async fn is_absent(&self, ctx: &ProbeContext) -> Result<bool, ProvisionError> {
        Ok(!ctx.probe().exists(&self.reference()).await?)
    }

    async fn teardown(&self, ctx: &StageContext) -> Result<(), ProvisionError> {
        // Scale owned workloads down first so the controller does not
        // recreate pods while the uninstall is in flight.
        let workloads = ctx.cluster().list_workloads(&self.namespace).await?;
        for workload in workloads {
            let owned = workload.data.get(RELEASE_INSTANCE_LABEL) == Some(&self.release);
            let running = workload
                .workload
                .as_ref()
                .is_some_and(|status| status.desired_replicas > 0);
            if let (true, true, ResourceRef::Workload { name, .. }) = (owned, running, &workload.reference) {
                ctx.cluster().scale(&self.namespace, name, 0).await?;
            }
        }

        let outcome = ctx.releases().uninstall(&self.namespace, &self.release).await?;
        info!(release = %self.release, namespace = %self.namespace, ?outcome, "Uninstalled release");
        Ok(())
    }
}
