//! State probe backed by the live collaborators.

use async_trait::async_trait;
use regex::Regex;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use super::StateProbe;
use crate::core::{ExternalSystem, ReadinessRule, Resource, ResourceRef, SecretValue};
use crate::credentials::{CredentialResolver, SecretRef};
use crate::errors::{CollaboratorError, ConfigError, ProvisionError};
use crate::ports::{
    ClusterClient, Collaborators, DatabaseAdmin, DatabaseConnection, DatabaseEndpoint, Identifier,
    ReleaseManager, SqlStatement,
};

/// Schema holding the participant registry table.
const REGISTRY_SCHEMA: &str = "public";
/// Participant registry table.
const REGISTRY_TABLE: &str = "edc_participant";

#[allow(clippy::expect_used)]
fn fatal_log_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"FATAL|OutOfMemory|NullPointerException|CrashLoopBackOff|BindException|Cannot start")
            .expect("static pattern")
    })
}

/// Returns the first log line carrying a fatal signature.
#[must_use]
pub fn fatal_log_line(lines: &[String]) -> Option<&str> {
    lines
        .iter()
        .map(String::as_str)
        .find(|line| fatal_log_pattern().is_match(line))
}

/// How to reach the database server administratively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseAccess {
    /// The server.
    pub endpoint: DatabaseEndpoint,
    /// Administrative login.
    pub admin_user: String,
    /// Where the administrative password lives.
    pub admin_password: SecretRef,
    /// Database to connect to for server-level statements.
    pub maintenance_database: Identifier,
}

impl DatabaseAccess {
    /// Builds the administrative connection, resolving the password from live state.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::SecretUnavailable`] if the password cannot be resolved.
    pub async fn admin_connection(
        &self,
        credentials: &CredentialResolver,
    ) -> Result<DatabaseConnection, ProvisionError> {
        Ok(DatabaseConnection {
            endpoint: self.endpoint.clone(),
            database: self.maintenance_database.clone(),
            user: self.admin_user.clone(),
            password: credentials.value(&self.admin_password).await?,
        })
    }

    /// Builds a connection for an application role.
    #[must_use]
    pub fn login(
        &self,
        database: &Identifier,
        role: &Identifier,
        password: SecretValue,
    ) -> DatabaseConnection {
        DatabaseConnection {
            endpoint: self.endpoint.clone(),
            database: database.clone(),
            user: role.to_string(),
            password,
        }
    }
}

/// Probe that reads the cluster, the release tool and the database.
pub struct LiveStateProbe {
    cluster: Arc<dyn ClusterClient>,
    releases: Arc<dyn ReleaseManager>,
    database: Arc<dyn DatabaseAdmin>,
    credentials: Arc<CredentialResolver>,
    access: Option<DatabaseAccess>,
}

impl fmt::Debug for LiveStateProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveStateProbe")
            .field("access", &self.access)
            .finish_non_exhaustive()
    }
}

impl LiveStateProbe {
    /// Creates a probe over the given collaborators.
    #[must_use]
    pub fn new(collaborators: &Collaborators, credentials: Arc<CredentialResolver>) -> Self {
        Self {
            cluster: collaborators.cluster.clone(),
            releases: collaborators.releases.clone(),
            database: collaborators.database.clone(),
            credentials,
            access: None,
        }
    }

    /// Enables database lookups.
    #[must_use]
    pub fn with_database_access(mut self, access: DatabaseAccess) -> Self {
        self.access = Some(access);
        self
    }

    fn access(&self) -> Result<&DatabaseAccess, ProvisionError> {
        self.access.as_ref().ok_or_else(|| {
            ConfigError::invalid("postgres", "database lookups need database access").into()
        })
    }

    async fn admin(&self) -> Result<DatabaseConnection, ProvisionError> {
        self.access()?.admin_connection(&self.credentials).await
    }

    async fn has_rows(
        &self,
        connection: &DatabaseConnection,
        statement: &SqlStatement,
    ) -> Result<bool, ProvisionError> {
        Ok(!self.database.query(connection, statement).await?.is_empty())
    }

    async fn database_owner(
        &self,
        admin: &DatabaseConnection,
        database: &Identifier,
    ) -> Result<Option<String>, ProvisionError> {
        let rows = self
            .database
            .query(
                admin,
                &SqlStatement::DatabaseOwner {
                    database: database.clone(),
                },
            )
            .await?;
        Ok(rows.into_iter().next().and_then(|row| row.into_iter().next()))
    }

    async fn table_exists(
        &self,
        admin: &DatabaseConnection,
        database: &Identifier,
        schema: &Identifier,
        table: &Identifier,
    ) -> Result<bool, ProvisionError> {
        if self.database_owner(admin, database).await?.is_none() {
            return Ok(false);
        }
        self.has_rows(
            &admin.on(database),
            &SqlStatement::TableExists {
                schema: schema.clone(),
                table: table.clone(),
            },
        )
        .await
    }

    async fn get_database_object(
        &self,
        reference: &ResourceRef,
    ) -> Result<Option<Resource>, ProvisionError> {
        let admin = self.admin().await?;
        let found = match reference {
            ResourceRef::Role { name } => {
                self.has_rows(&admin, &SqlStatement::RoleExists { role: name.clone() })
                    .await?
            }
            ResourceRef::Database { name } => {
                return Ok(self
                    .database_owner(&admin, name)
                    .await?
                    .map(|owner| Resource::new(reference.clone()).with_data("owner", owner)));
            }
            ResourceRef::Table {
                database,
                schema,
                name,
            } => self.table_exists(&admin, database, schema, name).await?,
            ResourceRef::Participant { database, id } => {
                let schema = Identifier::new(REGISTRY_SCHEMA)?;
                let table = Identifier::new(REGISTRY_TABLE)?;
                self.table_exists(&admin, database, &schema, &table).await?
                    && self
                        .has_rows(
                            &admin.on(database),
                            &SqlStatement::ParticipantExists {
                                participant_id: id.clone(),
                            },
                        )
                        .await?
            }
            _ => false,
        };
        Ok(found.then(|| Resource::new(reference.clone())))
    }

    async fn can_login(&self, connection: &DatabaseConnection) -> bool {
        match self.database.query(connection, &SqlStatement::Ping).await {
            Ok(_) => true,
            Err(err) => {
                debug!(user = %connection.user, database = %connection.database, error = %err, "Login probe failed");
                false
            }
        }
    }

    fn wrong_rule(reference: &ResourceRef, rule: &ReadinessRule) -> ProvisionError {
        ConfigError::invalid(
            "readiness_rule",
            format!("{rule:?} does not apply to {reference}"),
        )
        .into()
    }
}

fn absent_on_not_found<T>(result: Result<Option<T>, CollaboratorError>) -> Result<Option<T>, ProvisionError> {
    match result {
        Ok(found) => Ok(found),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl StateProbe for LiveStateProbe {
    async fn get(&self, reference: &ResourceRef) -> Result<Option<Resource>, ProvisionError> {
        match reference.system() {
            ExternalSystem::Cluster => absent_on_not_found(self.cluster.get(reference).await),
            ExternalSystem::Releases => {
                let ResourceRef::Release { namespace, name } = reference else {
                    return Ok(None);
                };
                let status = absent_on_not_found(self.releases.status(namespace, name).await)?;
                Ok(status.map(|status| Resource::new(reference.clone()).with_phase(status.to_string())))
            }
            ExternalSystem::Database => self.get_database_object(reference).await,
        }
    }

    async fn is_ready(
        &self,
        reference: &ResourceRef,
        rule: &ReadinessRule,
    ) -> Result<bool, ProvisionError> {
        match rule {
            ReadinessRule::Exists => self.exists(reference).await,
            ReadinessRule::NamespaceActive => Ok(self
                .get(reference)
                .await?
                .is_some_and(|ns| ns.phase.as_deref() != Some("Terminating"))),
            ReadinessRule::PodRunning => Ok(self.get(reference).await?.is_some_and(|pod| {
                pod.workload
                    .is_some_and(|status| status.pods.iter().any(crate::core::PodStatus::is_running))
            })),
            ReadinessRule::WorkloadAvailable { min_ready } => {
                let Some(resource) = self.get(reference).await? else {
                    return Ok(false);
                };
                let Some(status) = resource.workload else {
                    return Ok(false);
                };
                if let Some(signature) = status.crash_signature() {
                    debug!(resource = %reference, signature, "Workload shows a crash-loop signature");
                    return Ok(false);
                }
                Ok(status.ready_replicas >= status.desired_replicas
                    && status.ready_replicas >= *min_ready)
            }
            ReadinessRule::ReleaseDeployed => Ok(self
                .get(reference)
                .await?
                .is_some_and(|release| release.phase.as_deref() == Some("deployed"))),
            ReadinessRule::DatabaseReachable => {
                let admin = self.admin().await?;
                Ok(self.can_login(&admin).await)
            }
            ReadinessRule::AcceptsLogin { role, password } => {
                let access = self.access()?;
                let database = match reference {
                    ResourceRef::Database { name } => name,
                    _ => &access.maintenance_database,
                };
                let password = self.credentials.value(password).await?;
                let connection = access.login(database, role, password);
                Ok(self.can_login(&connection).await)
            }
            ReadinessRule::NoFatalLogs { tail } => {
                let ResourceRef::Workload { namespace, name } = reference else {
                    return Err(Self::wrong_rule(reference, rule));
                };
                let lines = match self.cluster.logs(namespace, name, *tail).await {
                    Ok(lines) => lines,
                    Err(err) if err.is_not_found() => return Ok(false),
                    Err(err) => return Err(err.into()),
                };
                if let Some(line) = fatal_log_line(&lines) {
                    debug!(resource = %reference, line, "Fatal signature in logs");
                    return Ok(false);
                }
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ReleaseStatus;
    use crate::testing::SimulatedEnvironment;

    fn ident(value: &str) -> Identifier {
        Identifier::new(value).unwrap()
    }

    fn setup() -> (Arc<SimulatedEnvironment>, LiveStateProbe) {
        let env = Arc::new(SimulatedEnvironment::new());
        let access = SimulatedEnvironment::default_access();
        env.seed_postgres(&access, "admin-pw");
        let collaborators = env.collaborators();
        let credentials = Arc::new(CredentialResolver::new(collaborators.secrets.clone()));
        let probe = LiveStateProbe::new(&collaborators, credentials).with_database_access(access);
        (env, probe)
    }

    #[tokio::test]
    async fn test_missing_namespace_is_absent_not_error() {
        let (_env, probe) = setup();
        assert!(!probe.exists(&ResourceRef::namespace("demo")).await.unwrap());
        let workload = ResourceRef::workload("demo", "demo-registration-service");
        assert!(probe.get(&workload).await.unwrap().is_none());
        assert!(!probe
            .is_ready(&workload, &ReadinessRule::WorkloadAvailable { min_ready: 1 })
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_workload_crash_loop_not_ready() {
        let (env, probe) = setup();
        env.seed_namespace("demo");
        env.seed_workload("demo", "demo-registration-service", 1);
        let workload = ResourceRef::workload("demo", "demo-registration-service");
        let rule = ReadinessRule::WorkloadAvailable { min_ready: 1 };

        assert!(probe.is_ready(&workload, &rule).await.unwrap());

        env.set_crash_loop("demo", "demo-registration-service", "CrashLoopBackOff");
        assert!(!probe.is_ready(&workload, &rule).await.unwrap());
    }

    #[tokio::test]
    async fn test_postgres_pod_running() {
        let (_env, probe) = setup();
        let pod = ResourceRef::pod("common-srvs", "common-srvs-postgresql-0");
        assert!(probe.is_ready(&pod, &ReadinessRule::PodRunning).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_deployed() {
        let (env, probe) = setup();
        let release = ResourceRef::release("demo", "demo-dataspace-s1");
        assert!(!probe.is_ready(&release, &ReadinessRule::ReleaseDeployed).await.unwrap());

        env.seed_release("demo", "demo-dataspace-s1", ReleaseStatus::PendingInstall);
        assert!(probe.exists(&release).await.unwrap());
        assert!(!probe.is_ready(&release, &ReadinessRule::ReleaseDeployed).await.unwrap());

        env.seed_release("demo", "demo-dataspace-s1", ReleaseStatus::Deployed);
        assert!(probe.is_ready(&release, &ReadinessRule::ReleaseDeployed).await.unwrap());
    }

    #[tokio::test]
    async fn test_database_objects() {
        let (env, probe) = setup();
        let db = ResourceRef::Database { name: ident("demo_rs") };
        let role = ResourceRef::Role { name: ident("demo_rsusr") };
        let participant = ResourceRef::Participant {
            database: ident("demo_rs"),
            id: "conn-oeg-demo".to_string(),
        };

        assert!(!probe.exists(&db).await.unwrap());
        assert!(!probe.exists(&participant).await.unwrap());

        env.seed_role("demo_rsusr", "pw");
        env.seed_database("demo_rs", "demo_rsusr");
        let found = probe.get(&db).await.unwrap().unwrap();
        assert_eq!(found.data.get("owner").map(String::as_str), Some("demo_rsusr"));
        assert!(probe.exists(&role).await.unwrap());

        // Registry table missing: participant is absent, not an error.
        assert!(!probe.exists(&participant).await.unwrap());
        env.seed_table("demo_rs", "public", "edc_participant");
        env.seed_participant("demo_rs", "conn-oeg-demo");
        assert!(probe.exists(&participant).await.unwrap());
    }

    #[tokio::test]
    async fn test_database_reachable_and_login() {
        let (env, probe) = setup();
        let server = ResourceRef::pod("common-srvs", "common-srvs-postgresql-0");
        assert!(probe.is_ready(&server, &ReadinessRule::DatabaseReachable).await.unwrap());

        env.set_database_up(false);
        assert!(!probe.is_ready(&server, &ReadinessRule::DatabaseReachable).await.unwrap());
        env.set_database_up(true);

        env.seed_namespace("demo");
        env.seed_secret("demo", "demo-rs-db", &[("password", "right")]);
        env.seed_role("demo_rsusr", "wrong");
        env.seed_database("demo_rs", "demo_rsusr");
        let rule = ReadinessRule::AcceptsLogin {
            role: ident("demo_rsusr"),
            password: SecretRef::new("demo", "demo-rs-db", "password"),
        };
        let db = ResourceRef::Database { name: ident("demo_rs") };
        assert!(!probe.is_ready(&db, &rule).await.unwrap());

        env.seed_role("demo_rsusr", "right");
        assert!(probe.is_ready(&db, &rule).await.unwrap());
    }

    #[tokio::test]
    async fn test_no_fatal_logs() {
        let (env, probe) = setup();
        env.seed_namespace("demo");
        env.seed_workload("demo", "conn-oeg-demo", 1);
        env.set_logs(
            "demo",
            "conn-oeg-demo",
            vec!["Started".to_string(), "java.net.BindException: Address in use".to_string()],
        );
        let workload = ResourceRef::workload("demo", "conn-oeg-demo");
        let rule = ReadinessRule::NoFatalLogs { tail: 100 };
        assert!(!probe.is_ready(&workload, &rule).await.unwrap());

        env.set_logs("demo", "conn-oeg-demo", vec!["Runtime ready".to_string()]);
        assert!(probe.is_ready(&workload, &rule).await.unwrap());

        let err = probe
            .is_ready(&ResourceRef::namespace("demo"), &rule)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("readiness_rule"));
    }

    #[tokio::test]
    async fn test_missing_admin_secret_is_unavailable() {
        let env = Arc::new(SimulatedEnvironment::new());
        let collaborators = env.collaborators();
        let credentials = Arc::new(CredentialResolver::new(collaborators.secrets.clone()));
        let probe = LiveStateProbe::new(&collaborators, credentials)
            .with_database_access(SimulatedEnvironment::default_access());

        let err = probe
            .exists(&ResourceRef::Role { name: ident("demo_rsusr") })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::SecretUnavailable);
    }

    #[test]
    fn test_fatal_log_line() {
        let lines = vec!["ok".to_string(), "FATAL: role does not exist".to_string()];
        assert_eq!(fatal_log_line(&lines), Some("FATAL: role does not exist"));
        assert_eq!(fatal_log_line(&["fine".to_string()]), None);
    }
}
