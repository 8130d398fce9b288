//! Contexts handed to stages during a run.
//!
//! [`ProbeContext`] carries only read-only capabilities and is what
//! `precondition`, `is_satisfied`, `verify` and `is_absent` receive, so those
//! predicates cannot reach a mutating collaborator. [`StageContext`] adds the
//! collaborators for `apply` and `teardown`.

use std::fmt;
use std::sync::Arc;

use super::RunIdentity;
use crate::cancellation::CancellationToken;
use crate::credentials::CredentialResolver;
use crate::errors::{ConfigError, ProvisionError};
use crate::ports::{
    ClusterClient, Collaborators, DatabaseAdmin, ReleaseManager, VaultOperator, VaultStatus,
};
use crate::probe::StateProbe;

/// Read-only view of live state for one run.
#[derive(Clone)]
pub struct ProbeContext {
    probe: Arc<dyn StateProbe>,
    credentials: Arc<CredentialResolver>,
    identity: Arc<RunIdentity>,
    vault: Option<Arc<dyn VaultStatus>>,
}

fn vault_missing() -> ProvisionError {
    ConfigError::invalid("common_services.vault", "no secrets-engine server is configured").into()
}

impl fmt::Debug for ProbeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeContext")
            .field("run_id", &self.identity.run_id)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl ProbeContext {
    /// Creates a read-only context.
    #[must_use]
    pub fn new(
        probe: Arc<dyn StateProbe>,
        credentials: Arc<CredentialResolver>,
        identity: Arc<RunIdentity>,
    ) -> Self {
        Self {
            probe,
            credentials,
            identity,
            vault: None,
        }
    }

    /// Attaches read access to the secrets-engine server.
    #[must_use]
    pub fn with_vault(mut self, vault: Option<Arc<dyn VaultStatus>>) -> Self {
        self.vault = vault;
        self
    }

    /// Returns the secrets-engine status queries.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no server is wired.
    pub fn vault(&self) -> Result<&dyn VaultStatus, ProvisionError> {
        self.vault.as_deref().ok_or_else(vault_missing)
    }

    /// Returns the state probe.
    #[must_use]
    pub fn probe(&self) -> &dyn StateProbe {
        self.probe.as_ref()
    }

    /// Returns the run's credential resolver.
    #[must_use]
    pub fn credentials(&self) -> &CredentialResolver {
        &self.credentials
    }

    /// Returns the run identity.
    #[must_use]
    pub fn identity(&self) -> &RunIdentity {
        &self.identity
    }
}

/// Full context for side-effecting stage actions.
#[derive(Clone)]
pub struct StageContext {
    read: ProbeContext,
    collaborators: Collaborators,
    cancel: Arc<CancellationToken>,
}

impl fmt::Debug for StageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("read", &self.read)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl StageContext {
    /// Creates a stage context.
    #[must_use]
    pub fn new(
        read: ProbeContext,
        collaborators: Collaborators,
        cancel: Arc<CancellationToken>,
    ) -> Self {
        Self {
            read,
            collaborators,
            cancel,
        }
    }

    /// Returns the read-only part of this context.
    #[must_use]
    pub fn read_only(&self) -> &ProbeContext {
        &self.read
    }

    /// Returns the state probe.
    #[must_use]
    pub fn probe(&self) -> &dyn StateProbe {
        self.read.probe()
    }

    /// Returns the run's credential resolver.
    #[must_use]
    pub fn credentials(&self) -> &CredentialResolver {
        self.read.credentials()
    }

    /// Returns the run identity.
    #[must_use]
    pub fn identity(&self) -> &RunIdentity {
        self.read.identity()
    }

    /// Returns the cluster client.
    #[must_use]
    pub fn cluster(&self) -> &dyn ClusterClient {
        self.collaborators.cluster.as_ref()
    }

    /// Returns the release manager.
    #[must_use]
    pub fn releases(&self) -> &dyn ReleaseManager {
        self.collaborators.releases.as_ref()
    }

    /// Returns the database client.
    #[must_use]
    pub fn database(&self) -> &dyn DatabaseAdmin {
        self.collaborators.database.as_ref()
    }

    /// Returns the secrets-engine administrative actions.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no server is wired.
    pub fn vault(&self) -> Result<&dyn VaultOperator, ProvisionError> {
        self.collaborators
            .vault
            .as_ref()
            .map(|v| v.operator.as_ref())
            .ok_or_else(vault_missing)
    }

    /// Returns the run's cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}
