//! Generated values file stage.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{ApplyMode, Condition, Stage, StageBase, StageBaseExt};
use crate::context::{ProbeContext, StageContext};
use crate::core::StageKind;
use crate::errors::{ConfigError, ProvisionError};
use crate::pipeline::RetryPolicy;

/// Renders a values document onto the operator's machine for a later
/// install to consume, and deletes it on reset.
///
/// The document carries names and references only. Secret values stay in
/// the cluster and are looked up by the chart.
#[derive(Debug, Clone)]
pub struct ValuesFileStage {
    base: StageBase,
    path: PathBuf,
    contents: String,
}

impl ValuesFileStage {
    /// Creates a stage writing `values` as YAML to `path`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the document cannot be rendered.
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        values: &serde_json::Value,
    ) -> Result<Self, ProvisionError> {
        let contents = serde_yaml::to_string(values)
            .map_err(|e| ConfigError::invalid("rendered_values", e.to_string()))?;
        Ok(Self {
            base: StageBase::new(name),
            path: path.into(),
            contents,
        })
    }

    /// Returns the file this stage writes.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn current(&self) -> Result<Option<String>, ProvisionError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error("read", &e)),
        }
    }

    fn io_error(&self, action: &str, err: &std::io::Error) -> ProvisionError {
        ProvisionError::apply_failed(
            self.name(),
            format!("could not {action} {}: {err}", self.path.display()),
        )
    }
}

impl StageBaseExt for ValuesFileStage {
    fn base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }
}

#[async_trait]
impl Stage for ValuesFileStage {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn kind(&self) -> StageKind {
        StageKind::Artifact
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

    async fn is_satisfied(&self, _ctx: &ProbeContext) -> Result<bool, ProvisionError> {
        Ok(self.current().await?.as_deref() == Some(self.contents.as_str()))
    }

    async fn apply(&self, _ctx: &StageContext, _mode: ApplyMode) -> Result<(), ProvisionError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| self.io_error("create the directory of", &e))?;
        }
        tokio::fs::write(&self.path, &self.contents)
            .await
            .map_err(|e| self.io_error("write", &e))?;
        info!(path = %self.path.display(), "Rendered values file");
        Ok(())
    }

    async fn verify(&self, ctx: &ProbeContext) -> Result<Condition, ProvisionError> {
        if self.is_satisfied(ctx).await? {
            Ok(Condition::Met)
        } else {
            Ok(Condition::unmet(format!(
                "{} does not hold the rendered values",
                self.path.display()
            )))
        }
    }

    async fn is_absent(&self, _ctx: &ProbeContext) -> Result<bool, ProvisionError> {
        Ok(tokio::fs::metadata(&self.path).await.is_err())
    }

    async fn teardown(&self, _ctx: &StageContext) -> Result<(), ProvisionError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!(path = %self.path.display(), "Removed values file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error("remove", &e)),
        }
    }
}
