//! Generated credentials secret stage.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::info;

use super::{ApplyMode, Condition, Stage, StageBase, StageBaseExt};
use crate::context::{ProbeContext, StageContext};
use crate::core::{ReadinessRule, ResourceRef, SecretValue, StageKind};
use crate::credentials::SecretRef;
use crate::errors::ProvisionError;
use crate::pipeline::RetryPolicy;
use crate::ports::Manifest;

/// Length of generated values.
const GENERATED_LENGTH: usize = 24;

/// Ensures a secret holds a value for every field, generating missing ones.
///
/// Fields that already exist are never regenerated, so a database role
/// created from an earlier value keeps working.
#[derive(Debug, Clone)]
pub struct SecretStage {
    base: StageBase,
    namespace: String,
    secret: String,
    fields: Vec<String>,
}

impl SecretStage {
    /// Creates a secret stage for the given fields.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        secret: impl Into<String>,
        fields: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let namespace = namespace.into();
        let base = StageBase::new(name);
        let mut stage = Self {
            base,
            secret: secret.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            namespace,
        };
        stage.base.add_prerequisite(
            ResourceRef::namespace(stage.namespace.clone()),
            ReadinessRule::NamespaceActive,
        );
        stage
    }

    /// Returns a reference to one of the managed fields.
    #[must_use]
    pub fn field(&self, key: &str) -> SecretRef {
        SecretRef::new(self.namespace.clone(), self.secret.clone(), key)
    }

    fn reference(&self) -> ResourceRef {
        ResourceRef::secret(self.namespace.clone(), self.secret.clone())
    }

    async fn present_fields(&self, ctx: &ProbeContext) -> Result<Vec<String>, ProvisionError> {
        Ok(ctx
            .probe()
            .get(&self.reference())
            .await?
            .map(|secret| {
                self.fields
                    .iter()
                    .filter(|f| secret.data.get(*f).is_some_and(|v| !v.is_empty()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl StageBaseExt for SecretStage {
    fn base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }
}

#[async_trait]
impl Stage for SecretStage {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn kind(&self) -> StageKind {
        StageKind::Secret
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
        Ok(self.present_fields(ctx).await?.len() == self.fields.len())
    }

    async fn apply(&self, ctx: &StageContext, _mode: ApplyMode) -> Result<(), ProvisionError> {
        let present = self.present_fields(ctx.read_only()).await?;
        let mut data = BTreeMap::new();
        for field in &self.fields {
            let value = if present.contains(field) {
                ctx.credentials().value(&self.field(field)).await?
            } else {
                SecretValue::generate(GENERATED_LENGTH)
            };
            data.insert(field.clone(), value);
        }

        ctx.cluster()
            .apply(&Manifest::Secret {
                namespace: self.namespace.clone(),
                name: self.secret.clone(),
                data,
            })
            .await?;
        ctx.credentials().invalidate(&self.namespace, &self.secret);
        info!(
            secret = %self.reference(),
            generated = self.fields.len() - present.len(),
            "Wrote credentials secret"
        );
        Ok(())
    }

    async fn is_absent(&self, ctx: &ProbeContext) -> Result<bool, ProvisionError> {
        Ok(!ctx.probe().exists(&self.reference()).await?)
    }

    async fn teardown(&self, ctx: &StageContext) -> Result<(), ProvisionError> {
        ctx.cluster().delete(&self.reference()).await?;
        ctx.credentials().invalidate(&self.namespace, &self.secret);
        Ok(())
    }
}
