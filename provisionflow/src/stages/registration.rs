//! Participant registration stage.

use async_trait::async_trait;
use tracing::info;

use super::{ApplyMode, Condition, Stage, StageBase, StageBaseExt};
use crate::context::{ProbeContext, StageContext};
use crate::core::{ReadinessRule, ResourceRef, StageKind};
use crate::credentials::SecretRef;
use crate::errors::ProvisionError;
use crate::pipeline::{wait_until, PollBudget, RetryPolicy};
use crate::ports::{Identifier, SqlStatement};
use crate::probe::DatabaseAccess;

/// Waits for a connector to register itself in the registration database.
///
/// Registration is performed by the connector on start-up, so `apply` only
/// waits. Reset removes the registry row directly.
#[derive(Debug, Clone)]
pub struct RegistrationStage {
    base: StageBase,
    access: DatabaseAccess,
    database: Identifier,
    participant_id: String,
    poll: PollBudget,
}

impl RegistrationStage {
    /// Creates a registration stage. The registry table must exist first.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry table names are not valid identifiers.
    pub fn new(
        name: impl Into<String>,
        access: DatabaseAccess,
        database: Identifier,
        participant_id: impl Into<String>,
        poll: PollBudget,
    ) -> Result<Self, ProvisionError> {
        let mut base = StageBase::new(name);
        base.add_prerequisite(Self::registry_table(&database)?, ReadinessRule::Exists);
        Ok(Self {
            base,
            access,
            database,
            participant_id: participant_id.into(),
            poll,
        })
    }

    /// The table connectors register themselves in.
    ///
    /// # Errors
    ///
    /// Returns an error if the table names are not valid identifiers.
    pub fn registry_table(database: &Identifier) -> Result<ResourceRef, ProvisionError> {
        Ok(ResourceRef::Table {
            database: database.clone(),
            schema: Identifier::new("public")?,
            name: Identifier::new("edc_participant")?,
        })
    }

    fn reference(&self) -> ResourceRef {
        ResourceRef::Participant {
            database: self.database.clone(),
            id: self.participant_id.clone(),
        }
    }
}

impl StageBaseExt for RegistrationStage {
    fn base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }
}

#[async_trait]
impl Stage for RegistrationStage {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn kind(&self) -> StageKind {
        StageKind::Registration
    }

    fn depends_on(&self) -> &[String] {
        self.base.depends_on()
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.base.retry().clone()
    }

    fn required_secrets(&self) -> Vec<SecretRef> {
        vec![self.access.admin_password.clone()]
    }

    fn teardown_secrets(&self) -> Vec<SecretRef> {
        vec![self.access.admin_password.clone()]
    }

    async fn precondition(&self, ctx: &ProbeContext) -> Result<Condition, ProvisionError> {
        self.base.check_prerequisites(ctx).await
    }

    async fn is_satisfied(&self, ctx: &ProbeContext) -> Result<bool, ProvisionError> {
        ctx.probe().exists(&self.reference()).await
    }

    async fn apply(&self, ctx: &StageContext, _mode: ApplyMode) -> Result<(), ProvisionError> {
        let reference = self.reference();
        let polls = wait_until("participant registration", self.poll, || {
            let reference = &reference;
            async move { ctx.probe().exists(reference).await }
        })
        .await?;
        info!(participant = %self.participant_id, polls, "Participant registered");
        Ok(())
    }

    async fn is_absent(&self, ctx: &ProbeContext) -> Result<bool, ProvisionError> {
        let server = ResourceRef::pod(
            self.access.endpoint.namespace.clone(),
            self.access.endpoint.pod.clone(),
        );
        if !ctx.probe().exists(&server).await? {
            return Ok(true);
        }
        Ok(!ctx.probe().exists(&self.reference()).await?)
    }

    async fn teardown(&self, ctx: &StageContext) -> Result<(), ProvisionError> {
        let admin = self.access.admin_connection(ctx.credentials()).await?;
        let removed = ctx
            .database()
            .execute(
                &admin.on(&self.database),
                &SqlStatement::DeleteParticipant {
                    participant_id: self.participant_id.clone(),
                },
            )
            .await?;
        info!(participant = %self.participant_id, removed, "Removed participant registration");
        Ok(())
    }
}
