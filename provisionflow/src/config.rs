//! Environment configuration and the shared resource-name mapping.
//!
//! Everything environment-specific (hosts, namespaces, chart locations,
//! timeouts) lives in one [`EnvironmentConfig`] value loaded from YAML or
//! JSON and passed explicitly to the catalog. [`ResourceNames`] derives every
//! shared name once, so provisioning and reset can never disagree about
//! which database, role or release belongs to which pipeline.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::credentials::SecretRef;
use crate::errors::ConfigError;
use crate::pipeline::{BackoffStrategy, PollBudget, RetryPolicy};
use crate::ports::{DatabaseEndpoint, Identifier, VaultEndpoint};
use crate::probe::DatabaseAccess;

/// Secret field holding a generated database password.
pub const PASSWORD_FIELD: &str = "password";

fn dns_label_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?$").expect("static pattern"))
}

/// Checks a cluster object name against DNS-1123 label rules.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] naming `field`.
pub fn validate_dns_label(field: &str, value: &str) -> Result<(), ConfigError> {
    if dns_label_pattern().is_match(value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            field,
            format!("'{value}' is not a valid DNS-1123 label"),
        ))
    }
}

/// Database server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PostgresConfig {
    /// Namespace of the database workload.
    pub namespace: String,
    /// Service name.
    pub service: String,
    /// Pod used for administrative sessions.
    pub pod: String,
    /// Service port.
    pub port: u16,
    /// Administrative role.
    pub admin_user: String,
    /// Secret holding the administrative password.
    pub admin_secret: String,
    /// Field of `admin_secret` holding the password.
    pub admin_secret_key: String,
    /// Database used for server-level statements.
    pub maintenance_database: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            namespace: "common-srvs".to_string(),
            service: "common-srvs-postgresql".to_string(),
            pod: "common-srvs-postgresql-0".to_string(),
            port: 5432,
            admin_user: "postgres".to_string(),
            admin_secret: "common-srvs-postgresql".to_string(),
            admin_secret_key: "postgres-password".to_string(),
            maintenance_database: "postgres".to_string(),
        }
    }
}

/// Shared platform services (identity provider, database, object store).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommonServicesConfig {
    /// Namespace for the shared services.
    pub namespace: String,
    /// Release name.
    pub release: String,
    /// Chart directory.
    pub chart_dir: PathBuf,
    /// Values files passed to the install.
    pub values_files: Vec<PathBuf>,
    /// Secret with the identity provider's external database credentials.
    pub keycloak_db_secret: String,
    /// Timeout for the install with hooks, in seconds.
    pub hooks_timeout_secs: u64,
    /// Timeout for the no-hooks fallback install, in seconds.
    pub no_hooks_timeout_secs: u64,
    /// Secrets-engine server to unseal after the install, if any.
    pub vault: Option<VaultConfig>,
}

/// Secrets-engine server installed with the shared services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VaultConfig {
    /// Pod that administrative commands run in.
    #[serde(default = "default_vault_pod")]
    pub pod: String,
    /// Init document holding the unseal key shares and root token.
    pub keys_file: PathBuf,
    /// Path the key/value engine is mounted at.
    #[serde(default = "default_kv_mount")]
    pub kv_mount: String,
}

fn default_vault_pod() -> String {
    "common-srvs-vault-0".to_string()
}

fn default_kv_mount() -> String {
    "secret".to_string()
}

impl CommonServicesConfig {
    /// Returns the secrets-engine endpoint, if one is configured.
    #[must_use]
    pub fn vault_endpoint(&self) -> Option<VaultEndpoint> {
        self.vault
            .as_ref()
            .map(|v| VaultEndpoint::new(self.namespace.clone(), v.pod.clone()))
    }
}

impl Default for CommonServicesConfig {
    fn default() -> Self {
        Self {
            namespace: "common-srvs".to_string(),
            release: "common-srvs".to_string(),
            chart_dir: PathBuf::from("common"),
            values_files: vec![PathBuf::from("common/values.yaml")],
            keycloak_db_secret: "keycloak-external-db".to_string(),
            hooks_timeout_secs: 300,
            no_hooks_timeout_secs: 1200,
            vault: None,
        }
    }
}

/// The dataspace and its registration service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataspaceConfig {
    /// Dataspace name, also the default namespace.
    pub name: String,
    /// Namespace override.
    pub namespace: Option<String>,
    /// Chart directory.
    pub chart_dir: PathBuf,
    /// Values files passed to the install.
    pub values_files: Vec<PathBuf>,
    /// Release name override (default `<name>-dataspace-s1`).
    pub release: Option<String>,
    /// Registration service workload override (default `<name>-registration-service`).
    pub registration_workload: Option<String>,
    /// Where to render the generated values file, passed last to the
    /// install and removed on reset. Nothing is rendered when unset.
    pub rendered_values: Option<PathBuf>,
}

impl Default for DataspaceConfig {
    fn default() -> Self {
        Self {
            name: "demo".to_string(),
            namespace: None,
            chart_dir: PathBuf::from("dataspace/step-1"),
            values_files: Vec::new(),
            release: None,
            registration_workload: None,
            rendered_values: None,
        }
    }
}

/// One connector joining the dataspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectorConfig {
    /// Connector name.
    pub name: String,
    /// Chart directory.
    #[serde(default = "default_connector_chart")]
    pub chart_dir: PathBuf,
    /// Values files passed to the install.
    #[serde(default)]
    pub values_files: Vec<PathBuf>,
    /// Management API port.
    #[serde(default = "default_management_port")]
    pub management_port: u16,
    /// Participant id override (default: the connector name).
    #[serde(default)]
    pub participant_id: Option<String>,
}

fn default_connector_chart() -> PathBuf {
    PathBuf::from("connector")
}

const fn default_management_port() -> u16 {
    19193
}

/// Retry tier settings applied to every stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Primary attempts, including the first.
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds.
    pub base_delay_ms: u64,
    /// Delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
    /// Timeout for each primary attempt, in seconds.
    pub apply_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
            max_delay_ms: 30_000,
            backoff: BackoffStrategy::Exponential,
            apply_timeout_secs: 300,
        }
    }
}

/// Bounded readiness waits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadinessConfig {
    /// Seconds between checks.
    pub interval_secs: u64,
    /// Maximum number of checks.
    pub max_polls: u32,
    /// Wall-clock budget in seconds.
    pub budget_secs: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            max_polls: 60,
            budget_secs: 300,
        }
    }
}

/// Reset convergence settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResetConfig {
    /// Seconds between absence checks.
    pub interval_secs: u64,
    /// Maximum number of absence checks per stage.
    pub max_polls: u32,
    /// Wall-clock budget per stage in seconds.
    pub convergence_secs: u64,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            max_polls: 60,
            convergence_secs: 300,
        }
    }
}

/// Everything environment-specific, passed explicitly into the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
    /// Environment id, used in reports and logs.
    pub environment: String,
    /// Database server.
    #[serde(default)]
    pub postgres: PostgresConfig,
    /// Shared services.
    #[serde(default)]
    pub common_services: CommonServicesConfig,
    /// The dataspace.
    #[serde(default)]
    pub dataspace: DataspaceConfig,
    /// Connectors.
    #[serde(default)]
    pub connectors: Vec<ConnectorConfig>,
    /// Retry tier.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Readiness waits.
    #[serde(default)]
    pub readiness: ReadinessConfig,
    /// Reset convergence.
    #[serde(default)]
    pub reset: ResetConfig,
}

impl EnvironmentConfig {
    /// Creates a configuration with defaults for everything but the id.
    #[must_use]
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            postgres: PostgresConfig::default(),
            common_services: CommonServicesConfig::default(),
            dataspace: DataspaceConfig::default(),
            connectors: Vec::new(),
            retry: RetryConfig::default(),
            readiness: ReadinessConfig::default(),
            reset: ResetConfig::default(),
        }
    }

    /// Adds a connector with default chart settings.
    #[must_use]
    pub fn with_connector(mut self, name: impl Into<String>) -> Self {
        self.connectors.push(ConnectorConfig {
            name: name.into(),
            chart_dir: default_connector_chart(),
            values_files: Vec::new(),
            management_port: default_management_port(),
            participant_id: None,
        });
        self
    }

    /// Loads and validates a configuration file. Files ending in `.json` are
    /// parsed as JSON, everything else as YAML.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config: Self = if is_json {
            serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates YAML text.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the text cannot be parsed or validated.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every field and the derived name mapping.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environment.trim().is_empty() {
            return Err(ConfigError::invalid("environment", "must not be empty"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::invalid(
                "retry.base_delay_ms",
                "must not exceed retry.max_delay_ms",
            ));
        }
        if self.readiness.max_polls == 0 || self.reset.max_polls == 0 {
            return Err(ConfigError::invalid("max_polls", "must be at least 1"));
        }
        if self.common_services.no_hooks_timeout_secs < self.common_services.hooks_timeout_secs {
            return Err(ConfigError::invalid(
                "common_services.no_hooks_timeout_secs",
                "the fallback timeout must not be shorter than the hooks timeout",
            ));
        }
        if let Some(vault) = &self.common_services.vault {
            validate_dns_label("common_services.vault.pod", &vault.pod)?;
            if vault.kv_mount.trim_matches('/').is_empty() {
                return Err(ConfigError::invalid(
                    "common_services.vault.kv_mount",
                    "must not be empty",
                ));
            }
        }
        self.resource_names().map(|_| ())
    }

    /// Derives the shared name mapping.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid names or collisions.
    pub fn resource_names(&self) -> Result<ResourceNames, ConfigError> {
        ResourceNames::derive(self)
    }

    /// Returns the administrative database access.
    ///
    /// # Errors
    ///
    /// Returns an error if the maintenance database is not a valid identifier.
    pub fn database_access(&self) -> Result<DatabaseAccess, ConfigError> {
        let pg = &self.postgres;
        Ok(DatabaseAccess {
            endpoint: DatabaseEndpoint {
                namespace: pg.namespace.clone(),
                service: pg.service.clone(),
                pod: pg.pod.clone(),
                port: pg.port,
            },
            admin_user: pg.admin_user.clone(),
            admin_password: SecretRef::new(&pg.namespace, &pg.admin_secret, &pg.admin_secret_key),
            maintenance_database: Identifier::new(&pg.maintenance_database)?,
        })
    }

    /// Returns the retry policy applied to stages without a fallback.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(self.retry.max_attempts)
            .with_base_delay_ms(self.retry.base_delay_ms)
            .with_max_delay_ms(self.retry.max_delay_ms)
            .with_backoff(self.retry.backoff)
            .with_apply_timeout(Duration::from_secs(self.retry.apply_timeout_secs))
    }

    /// Returns the budget for readiness waits.
    #[must_use]
    pub fn readiness_budget(&self) -> PollBudget {
        PollBudget::new(
            Duration::from_secs(self.readiness.interval_secs),
            self.readiness.max_polls,
            Duration::from_secs(self.readiness.budget_secs),
        )
    }

    /// Returns the per-stage convergence budget for reset.
    #[must_use]
    pub fn reset_budget(&self) -> PollBudget {
        PollBudget::new(
            Duration::from_secs(self.reset.interval_secs),
            self.reset.max_polls,
            Duration::from_secs(self.reset.convergence_secs),
        )
    }
}

/// Names owned by the shared services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommonNames {
    /// Namespace.
    pub namespace: String,
    /// Release.
    pub release: String,
    /// Identity provider database credentials secret.
    pub keycloak_db_secret: String,
}

/// A database with its owning role and the secret holding the role's password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseNames {
    /// Database.
    pub database: Identifier,
    /// Owning role.
    pub role: Identifier,
    /// Secret holding the role's password, in the consumer's namespace.
    pub credentials_secret: String,
}

impl DatabaseNames {
    /// Returns where the role's password lives.
    #[must_use]
    pub fn password(&self, namespace: &str) -> SecretRef {
        SecretRef::new(namespace, &self.credentials_secret, PASSWORD_FIELD)
    }
}

/// Names owned by the dataspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataspaceNames {
    /// Namespace.
    pub namespace: String,
    /// Release.
    pub release: String,
    /// Registration service database.
    pub registration_db: DatabaseNames,
    /// Registration service workload.
    pub registration_workload: String,
    /// ConfigMap with the registration service's datasource settings.
    pub config_map: String,
    /// Secret with the registration service's datasource password.
    pub runtime_secret: String,
}

/// Names owned by one connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectorNames {
    /// Connector name.
    pub name: String,
    /// Namespace (the dataspace namespace).
    pub namespace: String,
    /// Release.
    pub release: String,
    /// Connector database.
    pub db: DatabaseNames,
    /// Participant id in the registration database.
    pub participant_id: String,
    /// Connector workload.
    pub workload: String,
}

/// The validated mapping of every shared resource name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceNames {
    /// Environment id.
    pub environment: String,
    /// Shared services.
    pub common: CommonNames,
    /// The dataspace.
    pub dataspace: DataspaceNames,
    /// Connectors, in configuration order.
    pub connectors: Vec<ConnectorNames>,
}

impl ResourceNames {
    fn derive(config: &EnvironmentConfig) -> Result<Self, ConfigError> {
        let common = CommonNames {
            namespace: config.common_services.namespace.clone(),
            release: config.common_services.release.clone(),
            keycloak_db_secret: config.common_services.keycloak_db_secret.clone(),
        };
        validate_dns_label("common_services.namespace", &common.namespace)?;
        validate_dns_label("common_services.release", &common.release)?;
        validate_dns_label("common_services.keycloak_db_secret", &common.keycloak_db_secret)?;
        validate_dns_label("postgres.namespace", &config.postgres.namespace)?;

        let ds = &config.dataspace;
        validate_dns_label("dataspace.name", &ds.name)?;
        let namespace = ds.namespace.clone().unwrap_or_else(|| ds.name.clone());
        validate_dns_label("dataspace.namespace", &namespace)?;
        let registration_workload = ds
            .registration_workload
            .clone()
            .unwrap_or_else(|| format!("{}-registration-service", ds.name));
        let dataspace = DataspaceNames {
            release: ds
                .release
                .clone()
                .unwrap_or_else(|| format!("{}-dataspace-s1", ds.name)),
            registration_db: DatabaseNames {
                database: Identifier::from_resource_name(&format!("{}_rs", ds.name))?,
                role: Identifier::from_resource_name(&format!("{}_rsusr", ds.name))?,
                credentials_secret: format!("{}-rs-db-credentials", ds.name),
            },
            config_map: format!("{registration_workload}-config"),
            runtime_secret: format!("{registration_workload}-secret"),
            registration_workload,
            namespace,
        };
        validate_dns_label("dataspace.release", &dataspace.release)?;
        validate_dns_label("dataspace.registration_workload", &dataspace.registration_workload)?;

        let mut connectors = Vec::with_capacity(config.connectors.len());
        for (index, connector) in config.connectors.iter().enumerate() {
            let field = format!("connectors[{index}].name");
            validate_dns_label(&field, &connector.name)?;
            let database = Identifier::from_resource_name(&connector.name)?;
            let names = ConnectorNames {
                name: connector.name.clone(),
                namespace: dataspace.namespace.clone(),
                release: format!("{}-{}", connector.name, ds.name),
                db: DatabaseNames {
                    role: database.clone(),
                    database,
                    credentials_secret: format!("{}-db-credentials", connector.name),
                },
                participant_id: connector
                    .participant_id
                    .clone()
                    .unwrap_or_else(|| connector.name.clone()),
                workload: connector.name.clone(),
            };
            validate_dns_label(&format!("connectors[{index}].release"), &names.release)?;
            connectors.push(names);
        }

        let names = Self {
            environment: config.environment.clone(),
            common,
            dataspace,
            connectors,
        };
        names.check_collisions()?;
        Ok(names)
    }

    fn check_collisions(&self) -> Result<(), ConfigError> {
        let mut claims: HashMap<String, String> = HashMap::new();
        let mut claim = |kind: &str, name: &str, owner: String| -> Result<(), ConfigError> {
            let key = format!("{kind}:{name}");
            if let Some(first) = claims.get(&key) {
                return Err(ConfigError::NameCollision {
                    name: name.to_string(),
                    first: first.clone(),
                    second: owner,
                });
            }
            claims.insert(key, owner);
            Ok(())
        };

        let ds = &self.dataspace;
        claim("database", ds.registration_db.database.as_str(), "dataspace".to_string())?;
        claim("role", ds.registration_db.role.as_str(), "dataspace".to_string())?;
        claim("release", &ds.release, "dataspace".to_string())?;
        claim("release", &self.common.release, "common-services".to_string())?;
        claim("participant", &self.common.release, "common-services".to_string())?;
        for connector in &self.connectors {
            let owner = format!("connector {}", connector.name);
            claim("database", connector.db.database.as_str(), owner.clone())?;
            claim("role", connector.db.role.as_str(), owner.clone())?;
            claim("release", &connector.release, owner.clone())?;
            claim("participant", &connector.participant_id, owner)?;
        }
        Ok(())
    }

    /// Looks up a connector by name.
    #[must_use]
    pub fn connector(&self, name: &str) -> Option<&ConnectorNames> {
        self.connectors.iter().find(|c| c.name == name)
    }
}
