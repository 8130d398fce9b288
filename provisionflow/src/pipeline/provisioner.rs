//! Entry point for running and resetting named pipelines.

use std::sync::Arc;

use super::{Orchestrator, PipelineCatalog, PipelineReport, ResetEngine, ResetReport, Runtime};
use crate::cancellation::CancellationToken;
use crate::config::EnvironmentConfig;
use crate::errors::ProvisionError;
use crate::events::EventSink;
use crate::ports::Collaborators;

/// Runs and resets the catalog's pipelines against one environment.
#[derive(Debug)]
pub struct Provisioner {
    catalog: PipelineCatalog,
    orchestrator: Orchestrator,
    reset: ResetEngine,
}

impl Provisioner {
    /// Builds the catalog and wires the collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: &EnvironmentConfig, collaborators: Collaborators) -> Result<Self, ProvisionError> {
        let runtime = Runtime::new(collaborators)
            .with_environment(config.environment.clone())
            .with_database_access(config.database_access()?);
        Self::with_runtime(config, runtime)
    }

    /// Builds the catalog around an already configured runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_runtime(config: &EnvironmentConfig, runtime: Runtime) -> Result<Self, ProvisionError> {
        let catalog = PipelineCatalog::from_config(config)?;
        let reset = ResetEngine::new(runtime.clone())
            .with_convergence(config.reset_budget())
            .with_teardown_policy(config.retry_policy());
        Ok(Self {
            catalog,
            orchestrator: Orchestrator::new(runtime),
            reset,
        })
    }

    /// Replaces the event sink for subsequent runs.
    #[must_use]
    pub fn with_event_sink(self, sink: Arc<dyn EventSink>) -> Self {
        self.map_runtime(|runtime| runtime.with_event_sink(sink))
    }

    /// Shares a cancellation token for subsequent runs.
    #[must_use]
    pub fn with_cancel_token(self, cancel: Arc<CancellationToken>) -> Self {
        self.map_runtime(|runtime| runtime.with_cancel_token(cancel))
    }

    fn map_runtime(self, f: impl FnOnce(Runtime) -> Runtime) -> Self {
        let runtime = f(self.orchestrator.runtime().clone());
        Self {
            catalog: self.catalog,
            reset: self.reset.with_runtime(runtime.clone()),
            orchestrator: Orchestrator::new(runtime),
        }
    }

    /// Returns the catalog.
    #[must_use]
    pub fn catalog(&self) -> &PipelineCatalog {
        &self.catalog
    }

    /// Provisions the named pipeline.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown names. Stage failures are
    /// reported in the returned report, not as errors.
    pub async fn run(&self, pipeline: &str) -> Result<PipelineReport, ProvisionError> {
        let pipeline = self.catalog.get(pipeline)?;
        Ok(self.orchestrator.run(pipeline).await)
    }

    /// Resets the named pipeline.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown names.
    pub async fn reset(&self, pipeline: &str) -> Result<ResetReport, ProvisionError> {
        let pipeline = self.catalog.get(pipeline)?;
        Ok(self.reset.reset(pipeline).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimulatedEnvironment;

    #[tokio::test]
    async fn test_unknown_pipeline_is_an_error() {
        let env = Arc::new(SimulatedEnvironment::new());
        let provisioner =
            Provisioner::new(&EnvironmentConfig::new("qa"), env.collaborators()).unwrap();
        assert!(matches!(
            provisioner.run("nope").await,
            Err(ProvisionError::Validation(_))
        ));
        assert!(provisioner.reset("nope").await.is_err());
        assert!(env.mutations().is_empty());
    }
}
