//! Contexts wired to a simulated environment.

use std::sync::Arc;
use std::time::Duration;

use super::SimulatedEnvironment;
use crate::cancellation::CancellationToken;
use crate::context::{ProbeContext, RunIdentity, RunMode, StageContext};
use crate::credentials::CredentialResolver;
use crate::probe::LiveStateProbe;
use crate::stages::ApplyMode;

/// Probe and stage contexts over one [`SimulatedEnvironment`], as a run
/// would build them.
#[derive(Debug)]
pub struct TestHarness {
    env: Arc<SimulatedEnvironment>,
    read: ProbeContext,
    stage: StageContext,
}

impl TestHarness {
    /// Creates a harness with a fresh credential cache.
    #[must_use]
    pub fn new(env: Arc<SimulatedEnvironment>) -> Self {
        let collaborators = env.collaborators();
        let credentials = Arc::new(CredentialResolver::new(collaborators.secrets.clone()));
        let probe = LiveStateProbe::new(&collaborators, credentials.clone())
            .with_database_access(SimulatedEnvironment::default_access());
        let identity = Arc::new(RunIdentity::new("test", "test", RunMode::Provision));
        let read = ProbeContext::new(Arc::new(probe), credentials, identity)
            .with_vault(collaborators.vault.as_ref().map(|v| v.status.clone()));
        let stage = StageContext::new(
            read.clone(),
            collaborators,
            Arc::new(CancellationToken::new()),
        );
        Self { env, read, stage }
    }

    /// Returns the environment.
    #[must_use]
    pub fn env(&self) -> &SimulatedEnvironment {
        &self.env
    }

    /// Returns the read-only context.
    #[must_use]
    pub fn read(&self) -> &ProbeContext {
        &self.read
    }

    /// Returns the full stage context.
    #[must_use]
    pub fn stage(&self) -> &StageContext {
        &self.stage
    }

    /// Returns the credential resolver.
    #[must_use]
    pub fn credentials(&self) -> &CredentialResolver {
        self.read.credentials()
    }

    /// Primary apply mode with a short timeout.
    #[must_use]
    pub fn primary_mode() -> ApplyMode {
        ApplyMode::Primary {
            timeout: Duration::from_secs(5),
        }
    }

    /// Primary apply mode with a short timeout.
    #[must_use]
    pub fn primary(&self) -> ApplyMode {
        Self::primary_mode()
    }

    /// Fallback apply mode with a short timeout.
    #[must_use]
    pub fn fallback(&self) -> ApplyMode {
        ApplyMode::Fallback {
            timeout: Duration::from_secs(10),
        }
    }
}
