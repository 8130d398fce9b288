//! Database server readiness and per-tenant database stages.

use async_trait::async_trait;
use tracing::{debug, info};

use super::{ApplyMode, Condition, Stage, StageBase, StageBaseExt};
use crate::context::{ProbeContext, StageContext};
use crate::core::{ReadinessRule, ResourceRef, StageKind};
use crate::credentials::SecretRef;
use crate::errors::ProvisionError;
use crate::pipeline::{wait_until, PollBudget, RetryPolicy};
use crate::ports::{DatabaseConnection, Identifier, SqlStatement};
use crate::probe::DatabaseAccess;

fn server_pod(access: &DatabaseAccess) -> ResourceRef {
    ResourceRef::pod(access.endpoint.namespace.clone(), access.endpoint.pod.clone())
}

/// Waits until the database server answers administrative queries.
#[derive(Debug, Clone)]
pub struct DatabaseReadyStage {
    base: StageBase,
    access: DatabaseAccess,
    poll: PollBudget,
}

impl DatabaseReadyStage {
    /// Creates a readiness stage for the server described by `access`.
    #[must_use]
    pub fn new(name: impl Into<String>, access: DatabaseAccess, poll: PollBudget) -> Self {
        let mut base = StageBase::new(name);
        base.add_prerequisite(server_pod(&access), ReadinessRule::Exists);
        Self { base, access, poll }
    }
}

impl StageBaseExt for DatabaseReadyStage {
    fn base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }
}

#[async_trait]
impl Stage for DatabaseReadyStage {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn kind(&self) -> StageKind {
        StageKind::Readiness
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

    async fn precondition(&self, ctx: &ProbeContext) -> Result<Condition, ProvisionError> {
        self.base.check_prerequisites(ctx).await
    }

    async fn is_satisfied(&self, ctx: &ProbeContext) -> Result<bool, ProvisionError> {
        ctx.probe()
            .is_ready(&server_pod(&self.access), &ReadinessRule::DatabaseReachable)
            .await
    }

    async fn apply(&self, ctx: &StageContext, _mode: ApplyMode) -> Result<(), ProvisionError> {
        let pod = server_pod(&self.access);
        let polls = wait_until("database server reachable", self.poll, || async {
            ctx.probe()
                .is_ready(&pod, &ReadinessRule::DatabaseReachable)
                .await
        })
        .await?;
        info!(server = %pod, polls, "Database server reachable");
        Ok(())
    }
}

/// Ensures a login role and a database owned by it.
///
/// The role's password always comes from the live secret, so a role created
/// in an earlier run with a since-regenerated secret gets its password reset.
#[derive(Debug, Clone)]
pub struct DatabaseStage {
    base: StageBase,
    access: DatabaseAccess,
    database: Identifier,
    role: Identifier,
    password: SecretRef,
}

impl DatabaseStage {
    /// Creates a database stage.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        access: DatabaseAccess,
        database: Identifier,
        role: Identifier,
        password: SecretRef,
    ) -> Self {
        let mut base = StageBase::new(name);
        base.add_prerequisite(server_pod(&access), ReadinessRule::DatabaseReachable);
        Self {
            base,
            access,
            database,
            role,
            password,
        }
    }

    fn database_ref(&self) -> ResourceRef {
        ResourceRef::Database {
            name: self.database.clone(),
        }
    }

    fn role_ref(&self) -> ResourceRef {
        ResourceRef::Role {
            name: self.role.clone(),
        }
    }

    fn login_rule(&self) -> ReadinessRule {
        ReadinessRule::AcceptsLogin {
            role: self.role.clone(),
            password: self.password.clone(),
        }
    }

    async fn owner(&self, ctx: &ProbeContext) -> Result<Option<String>, ProvisionError> {
        Ok(ctx
            .probe()
            .get(&self.database_ref())
            .await?
            .and_then(|db| db.data.get("owner").cloned()))
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        admin: &DatabaseConnection,
        statement: SqlStatement,
    ) -> Result<(), ProvisionError> {
        debug!(stage = %self.name(), sql = %statement.redacted(), "Executing statement");
        ctx.database().execute(admin, &statement).await?;
        Ok(())
    }
}

impl StageBaseExt for DatabaseStage {
    fn base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }
}

#[async_trait]
impl Stage for DatabaseStage {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn kind(&self) -> StageKind {
        StageKind::Database
    }

    fn depends_on(&self) -> &[String] {
        self.base.depends_on()
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.base.retry().clone()
    }

    fn required_secrets(&self) -> Vec<SecretRef> {
        vec![self.access.admin_password.clone(), self.password.clone()]
    }

    fn teardown_secrets(&self) -> Vec<SecretRef> {
        vec![self.access.admin_password.clone()]
    }

    async fn precondition(&self, ctx: &ProbeContext) -> Result<Condition, ProvisionError> {
        self.base.check_prerequisites(ctx).await
    }

    async fn is_satisfied(&self, ctx: &ProbeContext) -> Result<bool, ProvisionError> {
        if !ctx.probe().exists(&self.role_ref()).await? {
            return Ok(false);
        }
        if self.owner(ctx).await?.as_deref() != Some(self.role.as_str()) {
            return Ok(false);
        }
        ctx.probe()
            .is_ready(&self.database_ref(), &self.login_rule())
            .await
    }

    async fn apply(&self, ctx: &StageContext, _mode: ApplyMode) -> Result<(), ProvisionError> {
        let admin = self.access.admin_connection(ctx.credentials()).await?;
        let password = ctx.credentials().value(&self.password).await?;

        let role = self.role.clone();
        if ctx.probe().exists(&self.role_ref()).await? {
            self.execute(ctx, &admin, SqlStatement::AlterRolePassword { role, password })
                .await?;
        } else {
            self.execute(ctx, &admin, SqlStatement::CreateRole { role, password })
                .await?;
        }

        let database = self.database.clone();
        let owner = self.role.clone();
        match self.owner(ctx.read_only()).await? {
            None => {
                self.execute(ctx, &admin, SqlStatement::CreateDatabase { database, owner })
                    .await?;
            }
            Some(current) if current != self.role.as_str() => {
                self.execute(ctx, &admin, SqlStatement::AlterDatabaseOwner { database, owner })
                    .await?;
            }
            Some(_) => {}
        }
        info!(database = %self.database, role = %self.role, "Database ready");
        Ok(())
    }

    async fn verify(&self, ctx: &ProbeContext) -> Result<Condition, ProvisionError> {
        if !ctx.probe().exists(&self.role_ref()).await? {
            return Ok(Condition::unmet(format!("{} does not exist", self.role_ref())));
        }
        match self.owner(ctx).await? {
            None => Ok(Condition::unmet(format!("{} does not exist", self.database_ref()))),
            Some(owner) if owner != self.role.as_str() => Ok(Condition::unmet(format!(
                "{} is owned by {owner}, not {}",
                self.database_ref(),
                self.role
            ))),
            Some(_) => Condition::require(ctx, &self.database_ref(), &self.login_rule()).await,
        }
    }

    async fn is_absent(&self, ctx: &ProbeContext) -> Result<bool, ProvisionError> {
        // No server pod means nothing left to drop.
        if !ctx.probe().exists(&server_pod(&self.access)).await? {
            return Ok(true);
        }
        Ok(!ctx.probe().exists(&self.database_ref()).await?
            && !ctx.probe().exists(&self.role_ref()).await?)
    }

    async fn teardown(&self, ctx: &StageContext) -> Result<(), ProvisionError> {
        let admin = self.access.admin_connection(ctx.credentials()).await?;
        let database = self.database.clone();
        self.execute(
            ctx,
            &admin,
            SqlStatement::TerminateSessions {
                database: database.clone(),
            },
        )
        .await?;
        self.execute(ctx, &admin, SqlStatement::DropDatabase { database })
            .await?;
        self.execute(
            ctx,
            &admin,
            SqlStatement::DropRole {
                role: self.role.clone(),
            },
        )
        .await?;
        info!(database = %self.database, role = %self.role, "Dropped database and role");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SimulatedEnvironment, TestHarness};
    use std::sync::Arc;
    use std::time::Duration;

    fn ident(value: &str) -> Identifier {
        Identifier::new(value).unwrap()
    }

    fn stage() -> DatabaseStage {
        DatabaseStage::new(
            "registration-database",
            SimulatedEnvironment::default_access(),
            ident("demo_rs"),
            ident("demo_rsusr"),
            SecretRef::new("demo", "demo-rs-db", "password"),
        )
    }

    fn seeded() -> Arc<SimulatedEnvironment> {
        let env = Arc::new(SimulatedEnvironment::new());
        env.seed_postgres(&SimulatedEnvironment::default_access(), "admin-pw");
        env.seed_namespace("demo");
        env.seed_secret("demo", "demo-rs-db", &[("password", "tenant-pw")]);
        env
    }

    #[tokio::test]
    async fn test_ready_stage_waits_for_server() {
        let env = seeded();
        env.set_database_up(false);
        let harness = TestHarness::new(env.clone());
        let poll = PollBudget::new(Duration::from_millis(1), 3, Duration::from_secs(1));
        let ready = DatabaseReadyStage::new("postgres-ready", SimulatedEnvironment::default_access(), poll);

        assert!(ready.precondition(harness.read()).await.unwrap().is_met());
        assert!(!ready.is_satisfied(harness.read()).await.unwrap());
        let err = ready.apply(harness.stage(), harness.primary()).await.unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::TimeoutExceeded);

        env.set_database_up(true);
        ready.apply(harness.stage(), harness.primary()).await.unwrap();
        assert!(ready.is_satisfied(harness.read()).await.unwrap());
    }

    #[tokio::test]
    async fn test_creates_role_and_database() {
        let env = seeded();
        let harness = TestHarness::new(env.clone());
        let stage = stage();

        assert!(!stage.is_satisfied(harness.read()).await.unwrap());
        stage.apply(harness.stage(), harness.primary()).await.unwrap();
        assert!(stage.verify(harness.read()).await.unwrap().is_met());
        assert_eq!(
            env.mutations(),
            vec![
                "sql CREATE ROLE \"demo_rsusr\" LOGIN PASSWORD '***'",
                "sql CREATE DATABASE \"demo_rs\" OWNER \"demo_rsusr\"",
            ]
        );
    }

    #[tokio::test]
    async fn test_already_present_is_satisfied_without_sql_writes() {
        let env = seeded();
        env.seed_role("demo_rsusr", "tenant-pw");
        env.seed_database("demo_rs", "demo_rsusr");
        let harness = TestHarness::new(env.clone());

        assert!(stage().is_satisfied(harness.read()).await.unwrap());
        assert!(env.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_stale_password_and_owner_are_repaired() {
        let env = seeded();
        env.seed_role("demo_rsusr", "old-pw");
        env.seed_role("someone_else", "x");
        env.seed_database("demo_rs", "someone_else");
        let harness = TestHarness::new(env.clone());
        let stage = stage();

        let condition = stage.verify(harness.read()).await.unwrap();
        assert_eq!(
            condition,
            Condition::unmet("database/demo_rs is owned by someone_else, not demo_rsusr")
        );
        stage.apply(harness.stage(), harness.primary()).await.unwrap();
        assert!(stage.is_satisfied(harness.read()).await.unwrap());
        assert_eq!(
            env.mutations(),
            vec![
                "sql ALTER ROLE \"demo_rsusr\" WITH LOGIN PASSWORD '***'",
                "sql ALTER DATABASE \"demo_rs\" OWNER TO \"demo_rsusr\"",
            ]
        );
    }

    #[tokio::test]
    async fn test_teardown_terminates_sessions_before_drop() {
        let env = seeded();
        env.seed_role("demo_rsusr", "tenant-pw");
        env.seed_database("demo_rs", "demo_rsusr");
        env.open_session("demo_rs");
        let harness = TestHarness::new(env.clone());
        let stage = stage();

        assert!(!stage.is_absent(harness.read()).await.unwrap());
        stage.teardown(harness.stage()).await.unwrap();
        assert!(stage.is_absent(harness.read()).await.unwrap());
        let mutations = env.mutations();
        assert!(mutations[0].starts_with("sql SELECT pg_terminate_backend"));
        assert_eq!(mutations[1], "sql DROP DATABASE IF EXISTS \"demo_rs\"");
        assert_eq!(mutations[2], "sql DROP ROLE IF EXISTS \"demo_rsusr\"");
    }

    #[tokio::test]
    async fn test_absent_when_server_is_gone() {
        let env = Arc::new(SimulatedEnvironment::new());
        let harness = TestHarness::new(env);
        assert!(stage().is_absent(harness.read()).await.unwrap());
    }
}
