//! Named pipelines built from an environment configuration.
//!
//! Every pipeline is assembled from the canonical stage library using the
//! shared [`ResourceNames`] mapping, so the same names drive provisioning and
//! reset.

use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

use super::{FallbackPolicy, Pipeline, PipelineBuilder, PollBudget, RetryPolicy};
use crate::config::{ConnectorNames, EnvironmentConfig, ResourceNames, PASSWORD_FIELD};
use crate::core::{ReadinessRule, ResourceRef};
use crate::errors::{ContractErrorInfo, PipelineValidationError, ProvisionError};
use crate::probe::DatabaseAccess;
use crate::stages::{
    DatabaseReadyStage, DatabaseStage, NamespaceStage, RegistrationStage, ReleaseStage,
    RolloutStage, RuntimeConfigStage, SecretStage, StageBaseExt, ValuesFileStage, VaultStage,
    VerificationStage,
};

/// Name of the shared services pipeline.
pub const COMMON_SERVICES: &str = "common-services";
/// Name of the dataspace pipeline.
pub const DATASPACE: &str = "dataspace";
/// Prefix of per-connector pipeline names.
pub const CONNECTOR_PREFIX: &str = "connector-";

/// Log lines inspected by the fatal-signature check.
const LOG_TAIL: usize = 200;

/// The named pipelines of one environment.
#[derive(Debug)]
pub struct PipelineCatalog {
    names: ResourceNames,
    pipelines: BTreeMap<String, Pipeline>,
    order: Vec<String>,
}

/// Settings shared by every pipeline in the catalog.
struct Shared<'a> {
    config: &'a EnvironmentConfig,
    names: &'a ResourceNames,
    access: DatabaseAccess,
    retry: RetryPolicy,
    readiness: PollBudget,
}

impl PipelineCatalog {
    /// Builds every pipeline the configuration describes.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a pipeline fails
    /// structural validation.
    pub fn from_config(config: &EnvironmentConfig) -> Result<Self, ProvisionError> {
        config.validate()?;
        let names = config.resource_names()?;
        let shared = Shared {
            config,
            names: &names,
            access: config.database_access()?,
            retry: config.retry_policy(),
            readiness: config.readiness_budget(),
        };

        let mut pipelines = vec![shared.common_services()?, shared.dataspace()?];
        for connector in &names.connectors {
            pipelines.push(shared.connector(connector)?);
        }

        let order = pipelines.iter().map(|p| p.name().to_string()).collect();
        Ok(Self {
            pipelines: pipelines
                .into_iter()
                .map(|p| (p.name().to_string(), p))
                .collect(),
            order,
            names,
        })
    }

    /// Looks up a pipeline by name.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the known pipelines.
    pub fn get(&self, name: &str) -> Result<&Pipeline, ProvisionError> {
        self.pipelines.get(name).ok_or_else(|| {
            PipelineValidationError::new(format!("Unknown pipeline '{name}'"))
                .with_error_info(
                    ContractErrorInfo::new("CATALOG-001-UNKNOWN", "No pipeline with this name")
                        .with_fix_hint(format!("Known pipelines: {}", self.order.join(", ")))
                        .with_context_entry("pipeline", name),
                )
                .into()
        })
    }

    /// Returns the pipeline names in provisioning order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Returns the pipelines in provisioning order.
    pub fn pipelines(&self) -> impl Iterator<Item = &Pipeline> {
        self.order.iter().filter_map(|name| self.pipelines.get(name))
    }

    /// Returns the resource names the pipelines were built from.
    #[must_use]
    pub fn resource_names(&self) -> &ResourceNames {
        &self.names
    }
}

impl Shared<'_> {
    fn common_services(&self) -> Result<Pipeline, ProvisionError> {
        let common = &self.names.common;
        let settings = &self.config.common_services;
        let hooks_timeout = Duration::from_secs(settings.hooks_timeout_secs);
        let no_hooks_timeout = Duration::from_secs(settings.no_hooks_timeout_secs);

        let release = settings.values_files.iter().fold(
            ReleaseStage::new(
                "common-release",
                common.release.clone(),
                common.namespace.clone(),
                settings.chart_dir.clone(),
            ),
            |stage, values| stage.with_values_file(values.clone()),
        );

        let builder = PipelineBuilder::new(COMMON_SERVICES)
            .add(
                NamespaceStage::new("namespace", common.namespace.clone())
                    .with_retry_policy(self.retry.clone()),
            )?
            .add(
                SecretStage::new(
                    "keycloak-db-secret",
                    common.namespace.clone(),
                    common.keycloak_db_secret.clone(),
                    [PASSWORD_FIELD],
                )
                .after(["namespace"])
                .with_retry_policy(self.retry.clone()),
            )?
            .add(
                release
                    .after(["namespace", "keycloak-db-secret"])
                    .with_retry_policy(
                        RetryPolicy::once()
                            .with_apply_timeout(hooks_timeout)
                            .with_fallback(FallbackPolicy::new(no_hooks_timeout)),
                    ),
            )?
            .add(
                DatabaseReadyStage::new("postgres-ready", self.access.clone(), self.readiness)
                    .after(["common-release"])
                    .with_retry_policy(self.readiness_retry()),
            )?;

        let builder = match (&settings.vault, settings.vault_endpoint()) {
            (Some(vault), Some(endpoint)) => builder.add(
                VaultStage::new("vault", endpoint, vault.keys_file.clone(), self.readiness)
                    .with_mount(vault.kv_mount.clone())
                    .after(["common-release"])
                    .with_retry_policy(self.readiness_retry()),
            )?,
            _ => builder,
        };
        Ok(builder.build()?)
    }

    fn dataspace(&self) -> Result<Pipeline, ProvisionError> {
        let ds = &self.names.dataspace;
        let settings = &self.config.dataspace;
        let db = &ds.registration_db;
        let password = db.password(&ds.namespace);

        let mut release = settings.values_files.iter().fold(
            ReleaseStage::new(
                "dataspace-release",
                ds.release.clone(),
                ds.namespace.clone(),
                settings.chart_dir.clone(),
            ),
            |stage, values| stage.with_values_file(values.clone()),
        );
        let mut release_after = vec!["namespace", "rs-database"];
        let rendered = settings
            .rendered_values
            .as_ref()
            .map(|path| ValuesFileStage::new("dataspace-values", path, &self.dataspace_values()))
            .transpose()?;
        if let Some(stage) = &rendered {
            release = release.with_values_file(stage.path());
            release_after.push("dataspace-values");
        }

        let verification = VerificationStage::new("verification", self.readiness)
            .check(
                ResourceRef::workload(ds.namespace.clone(), ds.registration_workload.clone()),
                ReadinessRule::WorkloadAvailable { min_ready: 1 },
            )
            .check(self.server_pod(), ReadinessRule::DatabaseReachable)
            .check(RegistrationStage::registry_table(&db.database)?, ReadinessRule::Exists)
            .check(
                ResourceRef::workload(ds.namespace.clone(), ds.registration_workload.clone()),
                ReadinessRule::NoFatalLogs { tail: LOG_TAIL },
            )
            .after(["registration-rollout"])
            .with_retry_policy(self.readiness_retry());

        let builder = match rendered {
            Some(stage) => PipelineBuilder::new(DATASPACE)
                .add(stage.with_retry_policy(self.retry.clone()))?,
            None => PipelineBuilder::new(DATASPACE),
        };
        Ok(builder
            .add(
                NamespaceStage::new("namespace", ds.namespace.clone())
                    .with_retry_policy(self.retry.clone()),
            )?
            .add(
                SecretStage::new(
                    "rs-credentials",
                    ds.namespace.clone(),
                    db.credentials_secret.clone(),
                    [PASSWORD_FIELD],
                )
                .after(["namespace"])
                .with_retry_policy(self.retry.clone()),
            )?
            .add(
                DatabaseReadyStage::new("postgres-ready", self.access.clone(), self.readiness)
                    .with_retry_policy(self.readiness_retry()),
            )?
            .add(
                DatabaseStage::new(
                    "rs-database",
                    self.access.clone(),
                    db.database.clone(),
                    db.role.clone(),
                    password.clone(),
                )
                .after(["rs-credentials", "postgres-ready"])
                .with_retry_policy(self.retry.clone()),
            )?
            .add(
                release
                    .after(release_after)
                    .with_retry_policy(self.retry.clone()),
            )?
            .add(
                RuntimeConfigStage::new(
                    "runtime-config",
                    ds.namespace.clone(),
                    ds.config_map.clone(),
                    ds.runtime_secret.clone(),
                    self.access.endpoint.clone(),
                    db.database.clone(),
                    db.role.clone(),
                    password,
                )
                .after(["dataspace-release"])
                .with_retry_policy(self.retry.clone()),
            )?
            .add(
                RolloutStage::new(
                    "registration-rollout",
                    ds.namespace.clone(),
                    ds.registration_workload.clone(),
                    self.readiness,
                )
                .with_config_source(ResourceRef::config_map(ds.namespace.clone(), ds.config_map.clone()))
                .with_config_source(ResourceRef::secret(ds.namespace.clone(), ds.runtime_secret.clone()))
                .after(["runtime-config"])
                .with_retry_policy(self.readiness_retry()),
            )?
            .add(verification)?
            .build()?)
    }

    fn connector(&self, connector: &ConnectorNames) -> Result<Pipeline, ProvisionError> {
        let settings = self
            .config
            .connectors
            .iter()
            .find(|c| c.name == connector.name)
            .ok_or_else(|| {
                PipelineValidationError::new(format!("No settings for connector '{}'", connector.name))
            })?;
        let registration_db = &self.names.dataspace.registration_db;

        let release = settings.values_files.iter().fold(
            ReleaseStage::new(
                "release",
                connector.release.clone(),
                connector.namespace.clone(),
                settings.chart_dir.clone(),
            ),
            |stage, values| stage.with_values_file(values.clone()),
        );

        Ok(PipelineBuilder::new(format!("{CONNECTOR_PREFIX}{}", connector.name))
            .add(
                SecretStage::new(
                    "credentials",
                    connector.namespace.clone(),
                    connector.db.credentials_secret.clone(),
                    [PASSWORD_FIELD],
                )
                .requires(
                    RegistrationStage::registry_table(&registration_db.database)?,
                    ReadinessRule::Exists,
                )
                .with_retry_policy(self.retry.clone()),
            )?
            .add(
                DatabaseStage::new(
                    "database",
                    self.access.clone(),
                    connector.db.database.clone(),
                    connector.db.role.clone(),
                    connector.db.password(&connector.namespace),
                )
                .after(["credentials"])
                .with_retry_policy(self.retry.clone()),
            )?
            .add(
                release
                    .after(["database"])
                    .with_retry_policy(self.retry.clone()),
            )?
            .add(
                RegistrationStage::new(
                    "registration",
                    self.access.clone(),
                    registration_db.database.clone(),
                    connector.participant_id.clone(),
                    self.readiness,
                )?
                .after(["release"])
                .with_retry_policy(self.readiness_retry()),
            )?
            .add(
                VerificationStage::new("verification", self.readiness)
                    .check(
                        ResourceRef::workload(connector.namespace.clone(), connector.workload.clone()),
                        ReadinessRule::WorkloadAvailable { min_ready: 1 },
                    )
                    .check(
                        ResourceRef::workload(connector.namespace.clone(), connector.workload.clone()),
                        ReadinessRule::NoFatalLogs { tail: LOG_TAIL },
                    )
                    .check(
                        ResourceRef::Participant {
                            database: registration_db.database.clone(),
                            id: connector.participant_id.clone(),
                        },
                        ReadinessRule::Exists,
                    )
                    .after(["registration"])
                    .with_retry_policy(self.readiness_retry()),
            )?
            .build()?)
    }

    /// Names the dataspace chart needs but cannot derive itself. Secret
    /// values are referenced by secret name and key, never inlined.
    fn dataspace_values(&self) -> serde_json::Value {
        let ds = &self.names.dataspace;
        let db = &ds.registration_db;
        let endpoint = &self.access.endpoint;
        json!({
            "dataspace": {
                "name": self.config.dataspace.name,
                "namespace": ds.namespace,
            },
            "registration-service": {
                "database": {
                    "host": endpoint.fqdn(),
                    "port": endpoint.port,
                    "name": db.database.as_str(),
                    "user": db.role.as_str(),
                    "existingSecret": db.credentials_secret,
                    "passwordKey": PASSWORD_FIELD,
                },
                "runtimeConfig": {
                    "configMap": ds.config_map,
                    "secret": ds.runtime_secret,
                },
            },
        })
    }

    /// Waiting stages poll internally, so a single attempt with a timeout
    /// covering the poll budget is enough.
    fn readiness_retry(&self) -> RetryPolicy {
        let timeout = self.readiness.budget + self.readiness.interval;
        RetryPolicy::once().with_apply_timeout(timeout.max(self.retry.apply_timeout))
    }

    fn server_pod(&self) -> ResourceRef {
        ResourceRef::pod(
            self.access.endpoint.namespace.clone(),
            self.access.endpoint.pod.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config() -> EnvironmentConfig {
        EnvironmentConfig::new("qa").with_connector("conn-oeg-demo")
    }

    #[test]
    fn test_catalog_names() {
        let catalog = PipelineCatalog::from_config(&config()).unwrap();
        assert_eq!(
            catalog.names(),
            &["common-services", "dataspace", "connector-conn-oeg-demo"]
        );
        assert_eq!(catalog.pipelines().count(), 3);
    }

    #[test]
    fn test_dataspace_stage_order() {
        let catalog = PipelineCatalog::from_config(&config()).unwrap();
        let dataspace = catalog.get(DATASPACE).unwrap();
        assert_eq!(
            dataspace.stage_names(),
            vec![
                "namespace",
                "rs-credentials",
                "postgres-ready",
                "rs-database",
                "dataspace-release",
                "runtime-config",
                "registration-rollout",
                "verification",
            ]
        );
    }

    #[test]
    fn test_common_release_has_no_hooks_fallback() {
        let catalog = PipelineCatalog::from_config(&config()).unwrap();
        let release = catalog
            .get(COMMON_SERVICES)
            .unwrap()
            .stage("common-release")
            .unwrap();
        let policy = release.retry_policy();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.apply_timeout, Duration::from_secs(300));
        let fallback = policy.fallback.unwrap();
        assert_eq!(fallback.timeout, Duration::from_secs(1200));
        assert!(fallback.teardown_first);
    }

    #[test]
    fn test_connector_pipeline() {
        let catalog = PipelineCatalog::from_config(&config()).unwrap();
        let connector = catalog.get("connector-conn-oeg-demo").unwrap();
        assert_eq!(
            connector.stage_names(),
            vec!["credentials", "database", "release", "registration", "verification"]
        );
        assert_eq!(
            connector.stage("database").unwrap().required_secrets()[1].name,
            "conn-oeg-demo-db-credentials"
        );
    }

    #[test]
    fn test_optional_vault_and_values_stages() {
        let mut config = config();
        config.common_services.vault = Some(crate::config::VaultConfig {
            pod: "common-srvs-vault-0".to_string(),
            keys_file: "common/init-keys-vault.json".into(),
            kv_mount: "secret".to_string(),
        });
        config.dataspace.rendered_values = Some("dataspace/step-1/values-demo.yaml".into());
        let catalog = PipelineCatalog::from_config(&config).unwrap();

        let common = catalog.get(COMMON_SERVICES).unwrap();
        assert_eq!(common.stage_names().last().map(String::as_str), Some("vault"));
        assert_eq!(
            common.stage("vault").unwrap().depends_on().to_vec(),
            vec!["common-release".to_string()]
        );

        let dataspace = catalog.get(DATASPACE).unwrap();
        assert_eq!(dataspace.stage_names()[0], "dataspace-values");
        assert!(dataspace
            .stage("dataspace-release")
            .unwrap()
            .depends_on()
            .contains(&"dataspace-values".to_string()));

        let values = Shared {
            config: &config,
            names: catalog.resource_names(),
            access: config.database_access().unwrap(),
            retry: config.retry_policy(),
            readiness: config.readiness_budget(),
        }
        .dataspace_values();
        assert_eq!(values["registration-service"]["database"]["name"], "demo_rs");
        assert_eq!(
            values["registration-service"]["database"]["existingSecret"],
            "demo-rs-db-credentials"
        );
    }

    #[test]
    fn test_unknown_pipeline() {
        let catalog = PipelineCatalog::from_config(&config()).unwrap();
        let err = catalog.get("monitoring").unwrap_err();
        match err {
            ProvisionError::Validation(validation) => {
                assert_eq!(validation.code(), Some("CATALOG-001-UNKNOWN"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = config();
        config.connectors.push(config.connectors[0].clone());
        assert!(matches!(
            PipelineCatalog::from_config(&config),
            Err(ProvisionError::Config(_))
        ));
    }
}
