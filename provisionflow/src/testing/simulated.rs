//! In-memory implementation of every collaborator capability.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::core::{ContainerStatus, PodStatus, Resource, ResourceRef, SecretValue, WorkloadStatus};
use crate::credentials::SecretRef;
use crate::errors::CollaboratorError;
use crate::ports::{
    ClusterClient, CollaboratorResult, Collaborators, DatabaseAdmin, DatabaseConnection,
    DatabaseEndpoint, DeleteOutcome, Identifier, Manifest, ReleaseInstall, ReleaseManager,
    ReleaseStatus, SealStatus, SecretStore, SqlStatement, VaultEndpoint, VaultOperator,
    VaultStatus, RELEASE_INSTANCE_LABEL,
};
use crate::probe::DatabaseAccess;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Debug, Clone, Default)]
struct SimWorkload {
    desired: u32,
    release: Option<String>,
    crash: Option<String>,
    logs: Vec<String>,
    annotations: BTreeMap<String, String>,
}

impl SimWorkload {
    fn status(&self, name: &str) -> WorkloadStatus {
        let pods = (0..self.desired)
            .map(|i| PodStatus {
                name: format!("{name}-{i}"),
                phase: if self.crash.is_some() { "Pending" } else { "Running" }.to_string(),
                init_containers: Vec::new(),
                containers: vec![ContainerStatus {
                    name: "main".to_string(),
                    ready: self.crash.is_none(),
                    reason: self.crash.clone(),
                    restart_count: u32::from(self.crash.is_some()) * 5,
                }],
            })
            .collect();
        WorkloadStatus {
            desired_replicas: self.desired,
            ready_replicas: if self.crash.is_some() { 0 } else { self.desired },
            pods,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SimDatabase {
    owner: String,
    tables: BTreeSet<(String, String)>,
    participants: BTreeSet<String>,
    sessions: u32,
}

#[derive(Debug, Clone, Default)]
struct SimVault {
    keys: Vec<String>,
    threshold: usize,
    submitted: BTreeSet<String>,
    sealed: bool,
    root_token: String,
    mounts: BTreeSet<String>,
}

impl SimVault {
    fn status(&self) -> SealStatus {
        SealStatus {
            initialized: true,
            sealed: self.sealed,
        }
    }

    fn authorize(&self, token: &SecretValue) -> CollaboratorResult<()> {
        if token.expose() == self.root_token {
            Ok(())
        } else {
            Err(CollaboratorError::rejected("vault", "permission denied"))
        }
    }
}

/// Objects a release creates when it installs.
#[derive(Debug, Clone, Default)]
pub struct ChartEffects {
    workloads: Vec<(String, u32)>,
    secrets: Vec<(String, Vec<(String, String)>)>,
    roles: Vec<(String, String)>,
    databases: Vec<(String, String)>,
    tables: Vec<(String, String, String)>,
    participants: Vec<(String, String)>,
}

impl ChartEffects {
    /// Creates an empty set of effects.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The release creates a workload in its namespace.
    #[must_use]
    pub fn workload(mut self, name: impl Into<String>, replicas: u32) -> Self {
        self.workloads.push((name.into(), replicas));
        self
    }

    /// The release creates a secret in its namespace.
    #[must_use]
    pub fn secret(mut self, name: impl Into<String>, fields: &[(&str, &str)]) -> Self {
        let fields = fields
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        self.secrets.push((name.into(), fields));
        self
    }

    /// The release bootstraps a database role.
    #[must_use]
    pub fn role(mut self, name: impl Into<String>, password: impl Into<String>) -> Self {
        self.roles.push((name.into(), password.into()));
        self
    }

    /// The release bootstraps a database.
    #[must_use]
    pub fn database(mut self, name: impl Into<String>, owner: impl Into<String>) -> Self {
        self.databases.push((name.into(), owner.into()));
        self
    }

    /// The release's workload migrates a table into an existing database.
    #[must_use]
    pub fn table(
        mut self,
        database: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        self.tables.push((database.into(), schema.into(), table.into()));
        self
    }

    /// The release's workload registers a participant.
    #[must_use]
    pub fn participant(mut self, database: impl Into<String>, id: impl Into<String>) -> Self {
        self.participants.push((database.into(), id.into()));
        self
    }

    /// The database server chart: server workload, admin secret, admin role
    /// and maintenance database.
    #[must_use]
    pub fn postgres(access: &DatabaseAccess, admin_password: &str) -> Self {
        Self::new()
            .workload(access.endpoint.service.clone(), 1)
            .secret(
                access.admin_password.name.clone(),
                &[(access.admin_password.key.as_str(), admin_password)],
            )
            .role(access.admin_user.clone(), admin_password)
            .database(access.maintenance_database.to_string(), access.admin_user.clone())
    }
}

#[derive(Debug)]
struct State {
    namespaces: BTreeMap<String, u32>,
    workloads: BTreeMap<Key, SimWorkload>,
    config_maps: BTreeMap<Key, BTreeMap<String, String>>,
    secrets: BTreeMap<Key, BTreeMap<String, String>>,
    releases: BTreeMap<Key, ReleaseStatus>,
    roles: BTreeMap<String, String>,
    databases: BTreeMap<String, SimDatabase>,
    vaults: BTreeMap<Key, SimVault>,
    events: BTreeMap<String, Vec<String>>,
    chart_effects: BTreeMap<String, ChartEffects>,
    failures: BTreeMap<String, u32>,
    database_up: bool,
    hooks_hang: bool,
    termination_polls: u32,
    mutations: Vec<String>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            namespaces: BTreeMap::new(),
            workloads: BTreeMap::new(),
            config_maps: BTreeMap::new(),
            secrets: BTreeMap::new(),
            releases: BTreeMap::new(),
            roles: BTreeMap::new(),
            databases: BTreeMap::new(),
            vaults: BTreeMap::new(),
            events: BTreeMap::new(),
            chart_effects: BTreeMap::new(),
            failures: BTreeMap::new(),
            database_up: true,
            hooks_hang: false,
            termination_polls: 0,
            mutations: Vec::new(),
        }
    }
}

impl State {
    fn record(&mut self, mutation: String) {
        self.mutations.push(mutation);
    }

    fn injected_failure(&mut self, operation: &str) -> CollaboratorResult<()> {
        match self.failures.get_mut(operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(CollaboratorError::transient(
                    operation,
                    "injected transient failure",
                ))
            }
            _ => Ok(()),
        }
    }

    fn namespace_active(&self, namespace: &str) -> bool {
        self.namespaces.get(namespace) == Some(&0)
    }

    fn require_namespace(&self, namespace: &str) -> CollaboratorResult<()> {
        if self.namespaces.contains_key(namespace) {
            Ok(())
        } else {
            Err(CollaboratorError::not_found(
                "cluster",
                format!("namespace/{namespace}"),
            ))
        }
    }

    fn remove_namespace(&mut self, namespace: &str) {
        self.namespaces.remove(namespace);
        self.workloads.retain(|(ns, _), _| ns != namespace);
        self.config_maps.retain(|(ns, _), _| ns != namespace);
        self.secrets.retain(|(ns, _), _| ns != namespace);
        self.releases.retain(|(ns, _), _| ns != namespace);
        self.vaults.retain(|(ns, _), _| ns != namespace);
    }

    fn workload_resource(&self, namespace: &str, name: &str, workload: &SimWorkload) -> Resource {
        let resource = workload.annotations.iter().fold(
            Resource::new(ResourceRef::workload(namespace, name)).with_workload(workload.status(name)),
            |resource, (key, value)| resource.with_data(key.clone(), value.clone()),
        );
        match &workload.release {
            Some(release) => resource.with_data(RELEASE_INSTANCE_LABEL, release.clone()),
            None => resource,
        }
    }

    fn find_pod(&self, namespace: &str, pod: &str) -> Option<PodStatus> {
        self.workloads
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .flat_map(|((_, name), workload)| workload.status(name).pods)
            .find(|status| status.name == pod)
    }

    fn apply_chart_effects(&mut self, namespace: &str, release: &str) {
        let Some(effects) = self.chart_effects.get(release).cloned() else {
            return;
        };
        for (name, replicas) in effects.workloads {
            let workload = self.workloads.entry(key(namespace, &name)).or_default();
            workload.desired = replicas;
            workload.release = Some(release.to_string());
        }
        for (name, fields) in effects.secrets {
            self.secrets
                .entry(key(namespace, &name))
                .or_insert_with(|| fields.into_iter().collect());
        }
        for (name, password) in effects.roles {
            self.roles.entry(name).or_insert(password);
        }
        for (name, owner) in effects.databases {
            self.databases.entry(name).or_insert_with(|| SimDatabase {
                owner,
                ..SimDatabase::default()
            });
        }
        for (database, schema, table) in effects.tables {
            if let Some(db) = self.databases.get_mut(&database) {
                db.tables.insert((schema, table));
            }
        }
        for (database, id) in effects.participants {
            if let Some(db) = self.databases.get_mut(&database) {
                if db.tables.contains(&("public".to_string(), "edc_participant".to_string())) {
                    db.participants.insert(id);
                }
            }
        }
    }

    fn vault(&mut self, endpoint: &VaultEndpoint) -> CollaboratorResult<&mut SimVault> {
        if self.find_pod(&endpoint.namespace, &endpoint.pod).is_none() {
            return Err(CollaboratorError::not_found("vault", endpoint.to_string()));
        }
        self.vaults
            .get_mut(&key(&endpoint.namespace, &endpoint.pod))
            .ok_or_else(|| CollaboratorError::rejected("vault", "Vault is not initialized"))
    }

    fn unsealed_vault(&mut self, endpoint: &VaultEndpoint) -> CollaboratorResult<&mut SimVault> {
        let vault = self.vault(endpoint)?;
        if vault.sealed {
            return Err(CollaboratorError::unavailable("vault", "Vault is sealed"));
        }
        Ok(vault)
    }

    fn server_running(&self, endpoint: &DatabaseEndpoint) -> bool {
        self.database_up && self.find_pod(&endpoint.namespace, &endpoint.pod).is_some()
    }

    fn authenticate(&self, connection: &DatabaseConnection) -> CollaboratorResult<()> {
        if !self.server_running(&connection.endpoint) {
            return Err(CollaboratorError::unavailable(
                "postgres",
                format!("could not connect to {}", connection.endpoint.fqdn()),
            ));
        }
        if self.roles.get(&connection.user).map(String::as_str) != Some(connection.password.expose()) {
            return Err(CollaboratorError::rejected(
                "postgres",
                format!("password authentication failed for user \"{}\"", connection.user),
            ));
        }
        if !self.databases.contains_key(connection.database.as_str()) {
            return Err(CollaboratorError::rejected(
                "postgres",
                format!("database \"{}\" does not exist", connection.database),
            ));
        }
        Ok(())
    }

    fn registry(&mut self, database: &Identifier) -> CollaboratorResult<&mut SimDatabase> {
        let db = self
            .databases
            .get_mut(database.as_str())
            .ok_or_else(|| CollaboratorError::rejected("postgres", "database does not exist"))?;
        if db.tables.contains(&("public".to_string(), "edc_participant".to_string())) {
            Ok(db)
        } else {
            Err(CollaboratorError::rejected(
                "postgres",
                "relation \"public.edc_participant\" does not exist",
            ))
        }
    }

    fn execute(&mut self, connection: &DatabaseConnection, statement: &SqlStatement) -> CollaboratorResult<u64> {
        let rejected = |message: String| Err(CollaboratorError::rejected("postgres", message));
        match statement {
            SqlStatement::CreateRole { role, password } => {
                if self.roles.contains_key(role.as_str()) {
                    return rejected(format!("role \"{role}\" already exists"));
                }
                self.roles.insert(role.to_string(), password.expose().to_string());
                Ok(0)
            }
            SqlStatement::AlterRolePassword { role, password } => match self.roles.get_mut(role.as_str()) {
                Some(current) => {
                    *current = password.expose().to_string();
                    Ok(0)
                }
                None => rejected(format!("role \"{role}\" does not exist")),
            },
            SqlStatement::CreateDatabase { database, owner } => {
                if self.databases.contains_key(database.as_str()) {
                    return rejected(format!("database \"{database}\" already exists"));
                }
                if !self.roles.contains_key(owner.as_str()) {
                    return rejected(format!("role \"{owner}\" does not exist"));
                }
                self.databases.insert(
                    database.to_string(),
                    SimDatabase {
                        owner: owner.to_string(),
                        ..SimDatabase::default()
                    },
                );
                Ok(0)
            }
            SqlStatement::AlterDatabaseOwner { database, owner } => {
                if !self.roles.contains_key(owner.as_str()) {
                    return rejected(format!("role \"{owner}\" does not exist"));
                }
                match self.databases.get_mut(database.as_str()) {
                    Some(db) => {
                        db.owner = owner.to_string();
                        Ok(0)
                    }
                    None => rejected(format!("database \"{database}\" does not exist")),
                }
            }
            SqlStatement::TerminateSessions { database } => Ok(self
                .databases
                .get_mut(database.as_str())
                .map_or(0, |db| u64::from(std::mem::take(&mut db.sessions)))),
            SqlStatement::DropDatabase { database } => match self.databases.get(database.as_str()) {
                Some(db) if db.sessions > 0 => rejected(format!(
                    "database \"{database}\" is being accessed by other users"
                )),
                Some(_) => {
                    self.databases.remove(database.as_str());
                    Ok(0)
                }
                None => Ok(0),
            },
            SqlStatement::DropRole { role } => {
                if self.databases.values().any(|db| db.owner == role.as_str()) {
                    return rejected(format!(
                        "role \"{role}\" cannot be dropped because some objects depend on it"
                    ));
                }
                self.roles.remove(role.as_str());
                Ok(0)
            }
            SqlStatement::DeleteParticipant { participant_id } => {
                let db = self.registry(&connection.database)?;
                Ok(u64::from(db.participants.remove(participant_id)))
            }
            _ => Ok(0),
        }
    }

    fn query(&mut self, connection: &DatabaseConnection, statement: &SqlStatement) -> CollaboratorResult<Vec<Vec<String>>> {
        let row = |value: &str| vec![vec![value.to_string()]];
        match statement {
            SqlStatement::Ping => Ok(row("1")),
            SqlStatement::RoleExists { role } => {
                Ok(if self.roles.contains_key(role.as_str()) { row("1") } else { Vec::new() })
            }
            SqlStatement::DatabaseOwner { database } => Ok(self
                .databases
                .get(database.as_str())
                .map(|db| row(&db.owner))
                .unwrap_or_default()),
            SqlStatement::TableExists { schema, table } => {
                let found = self
                    .databases
                    .get(connection.database.as_str())
                    .is_some_and(|db| db.tables.contains(&(schema.to_string(), table.to_string())));
                Ok(if found { row("1") } else { Vec::new() })
            }
            SqlStatement::ParticipantExists { participant_id } => {
                let db = self.registry(&connection.database)?;
                Ok(if db.participants.contains(participant_id) { row("1") } else { Vec::new() })
            }
            other => Err(CollaboratorError::rejected(
                "postgres",
                format!("not a query: {}", other.redacted()),
            )),
        }
    }
}

/// An in-memory cluster, release tool, database server and secrets store.
///
/// Every mutating call is recorded in [`mutations`](Self::mutations), with
/// secrets redacted. Fault knobs simulate hooks that hang, crash-looping
/// workloads, an unreachable database, slow namespace termination and
/// transient failures.
#[derive(Debug, Default)]
pub struct SimulatedEnvironment {
    state: Mutex<State>,
}

impl SimulatedEnvironment {
    /// Creates an empty environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the collaborators backed by this environment.
    #[must_use]
    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators::new(self.clone(), self.clone(), self.clone(), self.clone())
            .with_vault(self.clone())
    }

    /// The database access used throughout the tests.
    ///
    /// # Panics
    ///
    /// Never; the identifiers are static and valid.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn default_access() -> DatabaseAccess {
        DatabaseAccess {
            endpoint: DatabaseEndpoint {
                namespace: "common-srvs".to_string(),
                service: "common-srvs-postgresql".to_string(),
                pod: "common-srvs-postgresql-0".to_string(),
                port: 5432,
            },
            admin_user: "postgres".to_string(),
            admin_password: SecretRef::new(
                "common-srvs",
                "common-srvs-postgresql",
                "postgres-password",
            ),
            maintenance_database: Identifier::new("postgres").expect("static identifier"),
        }
    }

    /// Seeds a running database server reachable through `access`.
    pub fn seed_postgres(&self, access: &DatabaseAccess, admin_password: &str) {
        self.seed_namespace(&access.endpoint.namespace);
        self.seed_workload(&access.endpoint.namespace, &access.endpoint.service, 1);
        self.seed_secret(
            &access.admin_password.namespace,
            &access.admin_password.name,
            &[(access.admin_password.key.as_str(), admin_password)],
        );
        self.seed_role(&access.admin_user, admin_password);
        self.seed_database(access.maintenance_database.as_str(), &access.admin_user);
    }

    /// Seeds an active namespace.
    pub fn seed_namespace(&self, namespace: &str) {
        self.state.lock().namespaces.insert(namespace.to_string(), 0);
    }

    /// Seeds a workload not owned by any release.
    pub fn seed_workload(&self, namespace: &str, name: &str, replicas: u32) {
        let mut state = self.state.lock();
        state.workloads.entry(key(namespace, name)).or_default().desired = replicas;
    }

    /// Seeds a workload owned by a release.
    pub fn seed_owned_workload(&self, namespace: &str, name: &str, release: &str, replicas: u32) {
        let mut state = self.state.lock();
        let workload = state.workloads.entry(key(namespace, name)).or_default();
        workload.desired = replicas;
        workload.release = Some(release.to_string());
    }

    /// Makes every pod of a workload report a crash-loop reason.
    pub fn set_crash_loop(&self, namespace: &str, name: &str, reason: &str) {
        if let Some(workload) = self.state.lock().workloads.get_mut(&key(namespace, name)) {
            workload.crash = Some(reason.to_string());
        }
    }

    /// Sets a workload's log lines.
    pub fn set_logs(&self, namespace: &str, name: &str, lines: Vec<String>) {
        if let Some(workload) = self.state.lock().workloads.get_mut(&key(namespace, name)) {
            workload.logs = lines;
        }
    }

    /// Seeds a release with a status.
    pub fn seed_release(&self, namespace: &str, name: &str, status: ReleaseStatus) {
        self.state.lock().releases.insert(key(namespace, name), status);
    }

    /// Seeds a role, or resets its password.
    pub fn seed_role(&self, name: &str, password: &str) {
        self.state
            .lock()
            .roles
            .insert(name.to_string(), password.to_string());
    }

    /// Seeds a database.
    pub fn seed_database(&self, name: &str, owner: &str) {
        self.state
            .lock()
            .databases
            .entry(name.to_string())
            .or_default()
            .owner = owner.to_string();
    }

    /// Seeds a table in an existing database.
    pub fn seed_table(&self, database: &str, schema: &str, table: &str) {
        if let Some(db) = self.state.lock().databases.get_mut(database) {
            db.tables.insert((schema.to_string(), table.to_string()));
        }
    }

    /// Seeds a participant registration in an existing database.
    pub fn seed_participant(&self, database: &str, id: &str) {
        if let Some(db) = self.state.lock().databases.get_mut(database) {
            db.participants.insert(id.to_string());
        }
    }

    /// Seeds an initialized, sealed secrets-engine server behind `pod`. The
    /// pod itself comes from a workload seeded or installed separately.
    pub fn seed_vault(&self, namespace: &str, pod: &str, keys: &[&str], threshold: usize, root_token: &str) {
        self.state.lock().vaults.insert(
            key(namespace, pod),
            SimVault {
                keys: keys.iter().map(|k| (*k).to_string()).collect(),
                threshold,
                sealed: true,
                root_token: root_token.to_string(),
                ..SimVault::default()
            },
        );
    }

    /// Seals a secrets-engine server again, as a restart would.
    pub fn seal_vault(&self, namespace: &str, pod: &str) {
        if let Some(vault) = self.state.lock().vaults.get_mut(&key(namespace, pod)) {
            vault.sealed = true;
        }
    }

    /// Returns the mounted secrets-engine paths.
    #[must_use]
    pub fn vault_mounts(&self, namespace: &str, pod: &str) -> Vec<String> {
        self.state
            .lock()
            .vaults
            .get(&key(namespace, pod))
            .map(|v| v.mounts.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Opens a client session against a database, blocking plain drops.
    pub fn open_session(&self, database: &str) {
        if let Some(db) = self.state.lock().databases.get_mut(database) {
            db.sessions += 1;
        }
    }

    /// Seeds a secret with plain-text fields, replacing any existing one.
    pub fn seed_secret(&self, namespace: &str, name: &str, fields: &[(&str, &str)]) {
        let fields = fields
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        self.state.lock().secrets.insert(key(namespace, name), fields);
    }

    /// Makes the database server unreachable, or reachable again.
    pub fn set_database_up(&self, up: bool) {
        self.state.lock().database_up = up;
    }

    /// Makes installs with hooks time out, leaving the release pending.
    pub fn set_hooks_hang(&self, hang: bool) {
        self.state.lock().hooks_hang = hang;
    }

    /// Keeps a deleted namespace terminating for `polls` lookups.
    pub fn set_namespace_termination_polls(&self, polls: u32) {
        self.state.lock().termination_polls = polls;
    }

    /// Fails the next `times` calls of `operation` with a transient error.
    ///
    /// Operations: `cluster.apply`, `cluster.delete`, `cluster.scale`,
    /// `helm.install`, `helm.uninstall`, `sql.execute`, `secrets.fetch`,
    /// `vault.unseal`.
    pub fn fail_next(&self, operation: &str, times: u32) {
        self.state.lock().failures.insert(operation.to_string(), times);
    }

    /// Registers what installing `release` creates.
    pub fn on_install(&self, release: &str, effects: ChartEffects) {
        self.state
            .lock()
            .chart_effects
            .insert(release.to_string(), effects);
    }

    /// Returns a config map entry.
    #[must_use]
    pub fn config_value(&self, namespace: &str, name: &str, entry: &str) -> Option<String> {
        self.state
            .lock()
            .config_maps
            .get(&key(namespace, name))
            .and_then(|data| data.get(entry).cloned())
    }

    /// Returns a plain-text secret field.
    #[must_use]
    pub fn secret_value(&self, namespace: &str, name: &str, field: &str) -> Option<String> {
        self.state
            .lock()
            .secrets
            .get(&key(namespace, name))
            .and_then(|data| data.get(field).cloned())
    }

    /// Returns true if the role exists.
    #[must_use]
    pub fn has_role(&self, name: &str) -> bool {
        self.state.lock().roles.contains_key(name)
    }

    /// Returns true if the database exists.
    #[must_use]
    pub fn has_database(&self, name: &str) -> bool {
        self.state.lock().databases.contains_key(name)
    }

    /// Returns every mutating call so far.
    #[must_use]
    pub fn mutations(&self) -> Vec<String> {
        self.state.lock().mutations.clone()
    }

    /// Forgets recorded mutations.
    pub fn clear_mutations(&self) {
        self.state.lock().mutations.clear();
    }
}

#[async_trait]
impl ClusterClient for SimulatedEnvironment {
    async fn get(&self, reference: &ResourceRef) -> CollaboratorResult<Option<Resource>> {
        let mut state = self.state.lock();
        let found = match reference {
            ResourceRef::Namespace { name } => match state.namespaces.get(name).copied() {
                None => None,
                Some(0) => Some(Resource::new(reference.clone()).with_phase("Active")),
                Some(1) => {
                    state.remove_namespace(name);
                    None
                }
                Some(remaining) => {
                    state.namespaces.insert(name.clone(), remaining - 1);
                    Some(Resource::new(reference.clone()).with_phase("Terminating"))
                }
            },
            ResourceRef::Workload { namespace, name } => state
                .workloads
                .get(&key(namespace, name))
                .map(|w| state.workload_resource(namespace, name, w)),
            ResourceRef::Pod { namespace, name } => state.find_pod(namespace, name).map(|pod| {
                Resource::new(reference.clone())
                    .with_phase(pod.phase.clone())
                    .with_workload(WorkloadStatus {
                        desired_replicas: 1,
                        ready_replicas: u32::from(pod.is_running()),
                        pods: vec![pod],
                    })
            }),
            ResourceRef::ConfigMap { namespace, name } => {
                state.config_maps.get(&key(namespace, name)).map(|data| {
                    let mut resource = Resource::new(reference.clone());
                    resource.data = data.clone();
                    resource
                })
            }
            ResourceRef::Secret { namespace, name } => {
                state.secrets.get(&key(namespace, name)).map(|data| {
                    let mut resource = Resource::new(reference.clone());
                    resource.data = data
                        .iter()
                        .map(|(k, v)| (k.clone(), STANDARD.encode(v)))
                        .collect();
                    resource
                })
            }
            _ => {
                return Err(CollaboratorError::rejected(
                    "cluster",
                    format!("{reference} is not a cluster object"),
                ))
            }
        };
        Ok(found)
    }

    async fn list_workloads(&self, namespace: &str) -> CollaboratorResult<Vec<Resource>> {
        let state = self.state.lock();
        Ok(state
            .workloads
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((ns, name), w)| state.workload_resource(ns, name, w))
            .collect())
    }

    async fn apply(&self, manifest: &Manifest) -> CollaboratorResult<()> {
        let mut state = self.state.lock();
        state.record(format!("cluster apply {}", manifest.reference()));
        state.injected_failure("cluster.apply")?;
        match manifest {
            Manifest::Namespace { name } => match state.namespaces.get(name) {
                Some(0) => {}
                Some(_) => {
                    return Err(CollaboratorError::transient(
                        "cluster",
                        format!("namespace {name} is being terminated"),
                    ))
                }
                None => {
                    state.namespaces.insert(name.clone(), 0);
                }
            },
            Manifest::ConfigMap {
                namespace,
                name,
                data,
            } => {
                state.require_namespace(namespace)?;
                state.config_maps.insert(key(namespace, name), data.clone());
            }
            Manifest::Secret {
                namespace,
                name,
                data,
            } => {
                state.require_namespace(namespace)?;
                let data = data
                    .iter()
                    .map(|(k, v)| (k.clone(), v.expose().to_string()))
                    .collect();
                state.secrets.insert(key(namespace, name), data);
            }
        }
        Ok(())
    }

    async fn delete(&self, reference: &ResourceRef) -> CollaboratorResult<DeleteOutcome> {
        let mut state = self.state.lock();
        state.record(format!("cluster delete {reference}"));
        state.injected_failure("cluster.delete")?;
        let removed = match reference {
            ResourceRef::Namespace { name } => {
                let Some(current) = state.namespaces.get(name).copied() else {
                    return Ok(DeleteOutcome::AlreadyAbsent);
                };
                if current > 0 {
                    return Ok(DeleteOutcome::Terminating);
                }
                if state.termination_polls == 0 {
                    state.remove_namespace(name);
                    return Ok(DeleteOutcome::Deleted);
                }
                let polls = state.termination_polls + 1;
                state.namespaces.insert(name.clone(), polls);
                return Ok(DeleteOutcome::Terminating);
            }
            ResourceRef::Workload { namespace, name } => {
                state.workloads.remove(&key(namespace, name)).is_some()
            }
            ResourceRef::ConfigMap { namespace, name } => {
                state.config_maps.remove(&key(namespace, name)).is_some()
            }
            ResourceRef::Secret { namespace, name } => {
                state.secrets.remove(&key(namespace, name)).is_some()
            }
            _ => {
                return Err(CollaboratorError::rejected(
                    "cluster",
                    format!("{reference} cannot be deleted through the cluster"),
                ))
            }
        };
        Ok(if removed {
            DeleteOutcome::Deleted
        } else {
            DeleteOutcome::AlreadyAbsent
        })
    }

    async fn scale(&self, namespace: &str, workload: &str, replicas: u32) -> CollaboratorResult<()> {
        let mut state = self.state.lock();
        state.record(format!("cluster scale deployment/{namespace}/{workload} {replicas}"));
        state.injected_failure("cluster.scale")?;
        match state.workloads.get_mut(&key(namespace, workload)) {
            Some(w) => {
                w.desired = replicas;
                Ok(())
            }
            None => Err(CollaboratorError::not_found(
                "cluster",
                format!("deployment/{namespace}/{workload}"),
            )),
        }
    }

    async fn restart_rollout(
        &self,
        namespace: &str,
        workload: &str,
        annotations: &BTreeMap<String, String>,
    ) -> CollaboratorResult<()> {
        let mut state = self.state.lock();
        state.record(format!("cluster restart deployment/{namespace}/{workload}"));
        match state.workloads.get_mut(&key(namespace, workload)) {
            Some(w) => {
                w.annotations.extend(annotations.clone());
                Ok(())
            }
            None => Err(CollaboratorError::not_found(
                "cluster",
                format!("deployment/{namespace}/{workload}"),
            )),
        }
    }

    async fn logs(&self, namespace: &str, workload: &str, tail: usize) -> CollaboratorResult<Vec<String>> {
        let state = self.state.lock();
        let w = state.workloads.get(&key(namespace, workload)).ok_or_else(|| {
            CollaboratorError::not_found("cluster", format!("deployment/{namespace}/{workload}"))
        })?;
        let skip = w.logs.len().saturating_sub(tail);
        Ok(w.logs[skip..].to_vec())
    }

    async fn events(&self, namespace: &str) -> CollaboratorResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .events
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl VaultStatus for SimulatedEnvironment {
    async fn seal_status(&self, endpoint: &VaultEndpoint) -> CollaboratorResult<Option<SealStatus>> {
        let mut state = self.state.lock();
        match state.vault(endpoint) {
            Ok(vault) => Ok(Some(vault.status())),
            Err(err) if err.is_not_found() => Ok(None),
            Err(_) => Ok(Some(SealStatus {
                initialized: false,
                sealed: true,
            })),
        }
    }

    async fn secret_engines(
        &self,
        endpoint: &VaultEndpoint,
        token: &SecretValue,
    ) -> CollaboratorResult<Vec<String>> {
        let mut state = self.state.lock();
        let vault = state.unsealed_vault(endpoint)?;
        vault.authorize(token)?;
        Ok(vault.mounts.iter().cloned().collect())
    }
}

#[async_trait]
impl VaultOperator for SimulatedEnvironment {
    async fn unseal(&self, endpoint: &VaultEndpoint, key: &SecretValue) -> CollaboratorResult<SealStatus> {
        let mut state = self.state.lock();
        state.record(format!("vault unseal {endpoint}"));
        state.injected_failure("vault.unseal")?;
        let vault = state.vault(endpoint)?;
        if !vault.sealed {
            return Ok(vault.status());
        }
        if !vault.keys.iter().any(|k| k == key.expose()) {
            return Err(CollaboratorError::rejected("vault", "invalid key"));
        }
        vault.submitted.insert(key.expose().to_string());
        if vault.submitted.len() >= vault.threshold {
            vault.sealed = false;
            vault.submitted.clear();
        }
        Ok(vault.status())
    }

    async fn enable_kv(&self, endpoint: &VaultEndpoint, token: &SecretValue, path: &str) -> CollaboratorResult<()> {
        let mut state = self.state.lock();
        state.record(format!("vault enable kv {endpoint} {path}"));
        let vault = state.unsealed_vault(endpoint)?;
        vault.authorize(token)?;
        let mount = crate::ports::mount_path(path);
        if !vault.mounts.insert(mount.clone()) {
            return Err(CollaboratorError::rejected(
                "vault",
                format!("path is already in use at {mount}"),
            ));
        }
        Ok(())
    }

    async fn disable_engine(&self, endpoint: &VaultEndpoint, token: &SecretValue, path: &str) -> CollaboratorResult<()> {
        let mut state = self.state.lock();
        state.record(format!("vault disable {endpoint} {path}"));
        let vault = state.unsealed_vault(endpoint)?;
        vault.authorize(token)?;
        vault.mounts.remove(&crate::ports::mount_path(path));
        Ok(())
    }
}

#[async_trait]
impl ReleaseManager for SimulatedEnvironment {
    async fn install(&self, request: &ReleaseInstall) -> CollaboratorResult<()> {
        let mut state = self.state.lock();
        state.record(format!(
            "helm install {}/{} hooks={}",
            request.namespace, request.release, request.hooks
        ));
        state.injected_failure("helm.install")?;

        let release_key = key(&request.namespace, &request.release);
        if let Some(
            ReleaseStatus::PendingInstall | ReleaseStatus::PendingUpgrade | ReleaseStatus::PendingRollback,
        ) = state.releases.get(&release_key)
        {
            return Err(CollaboratorError::transient(
                "helm",
                "another operation (install/upgrade/rollback) is in progress",
            ));
        }
        if !state.namespace_active(&request.namespace) {
            if request.create_namespace && !state.namespaces.contains_key(&request.namespace) {
                state.namespaces.insert(request.namespace.clone(), 0);
            } else {
                state.require_namespace(&request.namespace)?;
            }
        }

        state.apply_chart_effects(&request.namespace, &request.release);
        if request.hooks && state.hooks_hang {
            state.releases.insert(release_key, ReleaseStatus::PendingInstall);
            return Err(CollaboratorError::timeout(
                "helm",
                "timed out waiting for the condition (post-install hook)",
            ));
        }
        state.releases.insert(release_key, ReleaseStatus::Deployed);
        Ok(())
    }

    async fn uninstall(&self, namespace: &str, release: &str) -> CollaboratorResult<DeleteOutcome> {
        let mut state = self.state.lock();
        state.record(format!("helm uninstall {namespace}/{release}"));
        state.injected_failure("helm.uninstall")?;
        if state.releases.remove(&key(namespace, release)).is_none() {
            return Ok(DeleteOutcome::AlreadyAbsent);
        }
        state
            .workloads
            .retain(|(ns, _), w| !(ns == namespace && w.release.as_deref() == Some(release)));
        Ok(DeleteOutcome::Deleted)
    }

    async fn status(&self, namespace: &str, release: &str) -> CollaboratorResult<Option<ReleaseStatus>> {
        Ok(self.state.lock().releases.get(&key(namespace, release)).cloned())
    }
}

#[async_trait]
impl DatabaseAdmin for SimulatedEnvironment {
    async fn execute(&self, connection: &DatabaseConnection, statement: &SqlStatement) -> CollaboratorResult<u64> {
        let mut state = self.state.lock();
        state.record(format!("sql {}", statement.redacted()));
        state.injected_failure("sql.execute")?;
        state.authenticate(connection)?;
        state.execute(connection, statement)
    }

    async fn query(&self, connection: &DatabaseConnection, statement: &SqlStatement) -> CollaboratorResult<Vec<Vec<String>>> {
        let mut state = self.state.lock();
        state.authenticate(connection)?;
        state.query(connection, statement)
    }
}

#[async_trait]
impl SecretStore for SimulatedEnvironment {
    async fn fetch(&self, namespace: &str, name: &str) -> CollaboratorResult<Option<BTreeMap<String, String>>> {
        let mut state = self.state.lock();
        state.injected_failure("secrets.fetch")?;
        Ok(state.secrets.get(&key(namespace, name)).map(|data| {
            data.iter()
                .map(|(k, v)| (k.clone(), STANDARD.encode(v)))
                .collect()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SecretValue;

    fn connection(env_access: &DatabaseAccess, password: &str) -> DatabaseConnection {
        DatabaseConnection {
            endpoint: env_access.endpoint.clone(),
            database: env_access.maintenance_database.clone(),
            user: env_access.admin_user.clone(),
            password: SecretValue::new(password),
        }
    }

    #[tokio::test]
    async fn test_namespace_termination_converges() {
        let env = SimulatedEnvironment::new();
        env.seed_namespace("demo");
        env.set_namespace_termination_polls(2);

        let ns = ResourceRef::namespace("demo");
        assert_eq!(env.delete(&ns).await.unwrap(), DeleteOutcome::Terminating);
        assert_eq!(env.get(&ns).await.unwrap().unwrap().phase.as_deref(), Some("Terminating"));
        assert_eq!(env.get(&ns).await.unwrap().unwrap().phase.as_deref(), Some("Terminating"));
        assert!(env.get(&ns).await.unwrap().is_none());
        assert_eq!(env.delete(&ns).await.unwrap(), DeleteOutcome::AlreadyAbsent);
    }

    #[tokio::test]
    async fn test_drop_blocked_by_sessions() {
        let env = SimulatedEnvironment::new();
        let access = SimulatedEnvironment::default_access();
        env.seed_postgres(&access, "pw");
        env.seed_role("tenant", "x");
        env.seed_database("tenant_db", "tenant");
        env.open_session("tenant_db");
        let admin = connection(&access, "pw");
        let drop = SqlStatement::DropDatabase {
            database: Identifier::new("tenant_db").unwrap(),
        };

        assert!(env.execute(&admin, &drop).await.is_err());
        env.execute(
            &admin,
            &SqlStatement::TerminateSessions {
                database: Identifier::new("tenant_db").unwrap(),
            },
        )
        .await
        .unwrap();
        env.execute(&admin, &drop).await.unwrap();
        assert!(!env.has_database("tenant_db"));
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let env = SimulatedEnvironment::new();
        let access = SimulatedEnvironment::default_access();
        env.seed_postgres(&access, "pw");
        let err = env
            .query(&connection(&access, "nope"), &SqlStatement::Ping)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let env = SimulatedEnvironment::new();
        env.fail_next("cluster.apply", 1);
        let manifest = Manifest::Namespace {
            name: "demo".to_string(),
        };
        assert!(env.apply(&manifest).await.unwrap_err().is_retryable());
        env.apply(&manifest).await.unwrap();
        assert_eq!(env.mutations().len(), 2);
    }

    #[tokio::test]
    async fn test_chart_effects_and_uninstall() {
        let env = SimulatedEnvironment::new();
        env.on_install(
            "demo-dataspace-s1",
            ChartEffects::new().workload("demo-registration-service", 1),
        );
        env.install(&ReleaseInstall::new("demo-dataspace-s1", "demo", "/charts/dataspace"))
            .await
            .unwrap();
        let workloads = env.list_workloads("demo").await.unwrap();
        assert_eq!(workloads.len(), 1);
        assert_eq!(
            workloads[0].data.get(RELEASE_INSTANCE_LABEL).map(String::as_str),
            Some("demo-dataspace-s1")
        );

        assert_eq!(
            env.uninstall("demo", "demo-dataspace-s1").await.unwrap(),
            DeleteOutcome::Deleted
        );
        assert!(env.list_workloads("demo").await.unwrap().is_empty());
    }
}
