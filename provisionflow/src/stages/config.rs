//! Runtime datasource configuration stage.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::BTreeMap;
use tracing::info;

use super::{ApplyMode, Condition, Stage, StageBase, StageBaseExt};
use crate::context::{ProbeContext, StageContext};
use crate::core::{ResourceRef, StageKind};
use crate::credentials::SecretRef;
use crate::errors::ProvisionError;
use crate::pipeline::RetryPolicy;
use crate::ports::{DatabaseEndpoint, Identifier, Manifest};

/// Config entry holding the JDBC URL.
pub const DATASOURCE_URL_KEY: &str = "SPRING_DATASOURCE_URL";
/// Config entry holding the login role.
pub const DATASOURCE_USERNAME_KEY: &str = "SPRING_DATASOURCE_USERNAME";
/// Secret entry holding the login password.
pub const DATASOURCE_PASSWORD_KEY: &str = "SPRING_DATASOURCE_PASSWORD";

/// Writes the datasource settings a workload reads at start-up.
///
/// Plain settings go to a config object, the password to a secret copied
/// from the live database credentials.
#[derive(Debug, Clone)]
pub struct RuntimeConfigStage {
    base: StageBase,
    namespace: String,
    config_map: String,
    secret: String,
    endpoint: DatabaseEndpoint,
    database: Identifier,
    role: Identifier,
    password: SecretRef,
}

impl RuntimeConfigStage {
    /// Creates a runtime config stage.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        config_map: impl Into<String>,
        secret: impl Into<String>,
        endpoint: DatabaseEndpoint,
        database: Identifier,
        role: Identifier,
        password: SecretRef,
    ) -> Self {
        Self {
            base: StageBase::new(name),
            namespace: namespace.into(),
            config_map: config_map.into(),
            secret: secret.into(),
            endpoint,
            database,
            role,
            password,
        }
    }

    fn config_ref(&self) -> ResourceRef {
        ResourceRef::config_map(self.namespace.clone(), self.config_map.clone())
    }

    fn secret_ref(&self) -> ResourceRef {
        ResourceRef::secret(self.namespace.clone(), self.secret.clone())
    }

    fn expected_config(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                DATASOURCE_URL_KEY.to_string(),
                self.endpoint.jdbc_url(&self.database),
            ),
            (DATASOURCE_USERNAME_KEY.to_string(), self.role.to_string()),
        ])
    }

    async fn check(&self, ctx: &ProbeContext) -> Result<Condition, ProvisionError> {
        let config = ctx.probe().get(&self.config_ref()).await?;
        let expected = self.expected_config();
        let config_ok = config.is_some_and(|c| {
            expected
                .iter()
                .all(|(key, value)| c.data.get(key) == Some(value))
        });
        if !config_ok {
            return Ok(Condition::unmet(format!(
                "{} does not hold the datasource settings",
                self.config_ref()
            )));
        }

        let password = ctx.credentials().value(&self.password).await?;
        let encoded = STANDARD.encode(password.expose());
        let secret_ok = ctx
            .probe()
            .get(&self.secret_ref())
            .await?
            .is_some_and(|s| s.data.get(DATASOURCE_PASSWORD_KEY) == Some(&encoded));
        if secret_ok {
            Ok(Condition::Met)
        } else {
            Ok(Condition::unmet(format!(
                "{} does not hold the current datasource password",
                self.secret_ref()
            )))
        }
    }
}

impl StageBaseExt for RuntimeConfigStage {
    fn base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }
}

#[async_trait]
impl Stage for RuntimeConfigStage {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn kind(&self) -> StageKind {
        StageKind::Config
    }

    fn depends_on(&self) -> &[String] {
        self.base.depends_on()
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.base.retry().clone()
    }

    fn required_secrets(&self) -> Vec<SecretRef> {
        vec![self.password.clone()]
    }

    async fn precondition(&self, ctx: &ProbeContext) -> Result<Condition, ProvisionError> {
        self.base.check_prerequisites(ctx).await
    }

    async fn is_satisfied(&self, ctx: &ProbeContext) -> Result<bool, ProvisionError> {
        Ok(self.check(ctx).await?.is_met())
    }

    async fn apply(&self, ctx: &StageContext, _mode: ApplyMode) -> Result<(), ProvisionError> {
        let password = ctx.credentials().value(&self.password).await?;
        ctx.cluster()
            .apply(&Manifest::ConfigMap {
                namespace: self.namespace.clone(),
                name: self.config_map.clone(),
                data: self.expected_config(),
            })
            .await?;
        ctx.cluster()
            .apply(&Manifest::Secret {
                namespace: self.namespace.clone(),
                name: self.secret.clone(),
                data: BTreeMap::from([(DATASOURCE_PASSWORD_KEY.to_string(), password)]),
            })
            .await?;
        ctx.credentials().invalidate(&self.namespace, &self.secret);
        info!(config_map = %self.config_ref(), secret = %self.secret_ref(), "Wrote runtime config");
        Ok(())
    }

    async fn verify(&self, ctx: &ProbeContext) -> Result<Condition, ProvisionError> {
        self.check(ctx).await
    }

    async fn is_absent(&self, ctx: &ProbeContext) -> Result<bool, ProvisionError> {
        Ok(!ctx.probe().exists(&self.config_ref()).await?
            && !ctx.probe().exists(&self.secret_ref()).await?)
    }

    async fn teardown(&self, ctx: &StageContext) -> Result<(), ProvisionError> {
        ctx.cluster().delete(&self.config_ref()).await?;
        ctx.cluster().delete(&self.secret_ref()).await?;
        ctx.credentials().invalidate(&self.namespace, &self.secret);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{SimulatedEnvironment, TestHarness};
    use std::sync::Arc;

    fn stage() -> RuntimeConfigStage {
        RuntimeConfigStage::new(
            "runtime-config",
            "demo",
            "demo-registration-service-config",
            "demo-registration-service-db",
            SimulatedEnvironment::default_access().endpoint,
            Identifier::new("demo_rs").unwrap(),
            Identifier::new("demo_rsusr").unwrap(),
            SecretRef::new("demo", "demo-rs-db", "password"),
        )
    }

    #[tokio::test]
    async fn test_writes_and_detects_config() {
        let env = Arc::new(SimulatedEnvironment::new());
        env.seed_namespace("demo");
        env.seed_secret("demo", "demo-rs-db", &[("password", "tenant-pw")]);
        let harness = TestHarness::new(env.clone());
        let stage = stage();

        let condition = stage.verify(harness.read()).await.unwrap();
        assert!(!condition.is_met());
        stage.apply(harness.stage(), harness.primary()).await.unwrap();
        assert!(stage.is_satisfied(harness.read()).await.unwrap());
        assert_eq!(
            env.config_value("demo", "demo-registration-service-config", DATASOURCE_URL_KEY),
            Some("jdbc:postgresql://common-srvs-postgresql.common-srvs:5432/demo_rs".to_string())
        );
    }

    #[tokio::test]
    async fn test_rotated_password_is_not_satisfied() {
        let env = Arc::new(SimulatedEnvironment::new());
        env.seed_namespace("demo");
        env.seed_secret("demo", "demo-rs-db", &[("password", "first")]);
        let stage = stage();
        stage
            .apply(TestHarness::new(env.clone()).stage(), TestHarness::primary_mode())
            .await
            .unwrap();

        env.seed_secret("demo", "demo-rs-db", &[("password", "second")]);
        let harness = TestHarness::new(env.clone());
        assert!(!stage.is_satisfied(harness.read()).await.unwrap());
    }

    #[tokio::test]
    async fn test_teardown_removes_both_objects() {
        let env = Arc::new(SimulatedEnvironment::new());
        env.seed_namespace("demo");
        env.seed_secret("demo", "demo-rs-db", &[("password", "tenant-pw")]);
        let harness = TestHarness::new(env.clone());
        let stage = stage();

        stage.apply(harness.stage(), harness.primary()).await.unwrap();
        assert!(!stage.is_absent(harness.read()).await.unwrap());
        stage.teardown(harness.stage()).await.unwrap();
        assert!(stage.is_absent(harness.read()).await.unwrap());
    }
}
