//! Capability interfaces consumed from external collaborators.
//!
//! The orchestrator never talks to a cluster, a package tool or a database
//! directly. It consumes four narrow capabilities, each a trait object that
//! the front end wires to real processes and tests wire to
//! [`SimulatedEnvironment`](crate::testing::SimulatedEnvironment). A fifth,
//! the secrets-engine server, is optional and only wired when configured.

mod cluster;
mod release;
mod sql;
mod vault;

pub use cluster::{DeleteOutcome, Manifest, CONFIG_HASH_ANNOTATION};
pub use release::{ReleaseInstall, ReleaseStatus, RELEASE_INSTANCE_LABEL};
pub use sql::{quote_literal, DatabaseConnection, DatabaseEndpoint, Identifier, SqlStatement};
pub use vault::{mount_path, SealStatus, VaultEndpoint};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::core::{Resource, ResourceRef, SecretValue};
use crate::errors::CollaboratorError;

/// Result type returned by collaborator capabilities.
pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// The cluster control plane.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Looks up a namespace, workload, pod, config map or secret.
    ///
    /// A missing object, or a missing parent namespace, is `Ok(None)`.
    async fn get(&self, reference: &ResourceRef) -> CollaboratorResult<Option<Resource>>;

    /// Lists the workloads in a namespace. A missing namespace yields an empty list.
    async fn list_workloads(&self, namespace: &str) -> CollaboratorResult<Vec<Resource>>;

    /// Creates or patches an object.
    async fn apply(&self, manifest: &Manifest) -> CollaboratorResult<()>;

    /// Deletes an object.
    async fn delete(&self, reference: &ResourceRef) -> CollaboratorResult<DeleteOutcome>;

    /// Scales a workload.
    async fn scale(&self, namespace: &str, workload: &str, replicas: u32)
        -> CollaboratorResult<()>;

    /// Triggers a rolling restart of a workload, stamping `annotations` on
    /// its pod template first. Template annotations read back as workload data.
    async fn restart_rollout(
        &self,
        namespace: &str,
        workload: &str,
        annotations: &BTreeMap<String, String>,
    ) -> CollaboratorResult<()>;

    /// Returns the trailing log lines of a workload.
    async fn logs(&self, namespace: &str, workload: &str, tail: usize)
        -> CollaboratorResult<Vec<String>>;

    /// Returns recent events in a namespace, for diagnostics.
    async fn events(&self, namespace: &str) -> CollaboratorResult<Vec<String>>;
}

/// The package-deployment tool.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReleaseManager: Send + Sync {
    /// Installs or upgrades a release.
    async fn install(&self, request: &ReleaseInstall) -> CollaboratorResult<()>;

    /// Uninstalls a release.
    async fn uninstall(&self, namespace: &str, release: &str) -> CollaboratorResult<DeleteOutcome>;

    /// Returns the release status, or `None` if no such release exists.
    async fn status(&self, namespace: &str, release: &str)
        -> CollaboratorResult<Option<ReleaseStatus>>;
}

/// The relational database client.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatabaseAdmin: Send + Sync {
    /// Executes a statement and returns the number of affected rows.
    async fn execute(
        &self,
        connection: &DatabaseConnection,
        statement: &SqlStatement,
    ) -> CollaboratorResult<u64>;

    /// Runs a query and returns its rows as text columns.
    async fn query(
        &self,
        connection: &DatabaseConnection,
        statement: &SqlStatement,
    ) -> CollaboratorResult<Vec<Vec<String>>>;
}

/// The secrets store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetches a secret's base64-encoded fields, or `None` if it does not exist.
    async fn fetch(
        &self,
        namespace: &str,
        name: &str,
    ) -> CollaboratorResult<Option<BTreeMap<String, String>>>;
}

/// Read-only queries against the secrets-engine server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VaultStatus: Send + Sync {
    /// Returns the seal state, or `None` if the server pod does not exist or
    /// is not listening yet.
    async fn seal_status(&self, endpoint: &VaultEndpoint) -> CollaboratorResult<Option<SealStatus>>;

    /// Lists mounted secrets engines as `path/` entries.
    async fn secret_engines(
        &self,
        endpoint: &VaultEndpoint,
        token: &SecretValue,
    ) -> CollaboratorResult<Vec<String>>;
}

/// Administrative actions on the secrets-engine server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VaultOperator: Send + Sync {
    /// Submits one unseal key share and returns the resulting state.
    async fn unseal(&self, endpoint: &VaultEndpoint, key: &SecretValue)
        -> CollaboratorResult<SealStatus>;

    /// Mounts a key/value engine at `path`.
    async fn enable_kv(
        &self,
        endpoint: &VaultEndpoint,
        token: &SecretValue,
        path: &str,
    ) -> CollaboratorResult<()>;

    /// Unmounts the engine at `path`. Unmounting a missing path succeeds.
    async fn disable_engine(
        &self,
        endpoint: &VaultEndpoint,
        token: &SecretValue,
        path: &str,
    ) -> CollaboratorResult<()>;
}

/// Both halves of the secrets-engine server capability.
#[derive(Clone)]
pub struct VaultAccess {
    /// Read-only queries.
    pub status: Arc<dyn VaultStatus>,
    /// Administrative actions.
    pub operator: Arc<dyn VaultOperator>,
}

/// The collaborators a run is wired to.
#[derive(Clone)]
pub struct Collaborators {
    /// Cluster control plane.
    pub cluster: Arc<dyn ClusterClient>,
    /// Package-deployment tool.
    pub releases: Arc<dyn ReleaseManager>,
    /// Database client.
    pub database: Arc<dyn DatabaseAdmin>,
    /// Secrets store.
    pub secrets: Arc<dyn SecretStore>,
    /// Secrets-engine server, when one is managed.
    pub vault: Option<VaultAccess>,
}

impl Collaborators {
    /// Bundles the four collaborators.
    #[must_use]
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        releases: Arc<dyn ReleaseManager>,
        database: Arc<dyn DatabaseAdmin>,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        Self {
            cluster,
            releases,
            database,
            secrets,
            vault: None,
        }
    }

    /// Wires the secrets-engine server.
    #[must_use]
    pub fn with_vault<V>(mut self, vault: Arc<V>) -> Self
    where
        V: VaultStatus + VaultOperator + 'static,
    {
        self.vault = Some(VaultAccess {
            status: vault.clone(),
            operator: vault,
        });
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
