//! Wiring shared by provisioning and reset runs.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::cancellation::CancellationToken;
use crate::context::{ProbeContext, RunIdentity, RunMode, StageContext};
use crate::credentials::CredentialResolver;
use crate::events::{EventSink, EventType, NoOpEventSink, ProvisionEvent};
use crate::observability::PipelineSpanAttributes;
use crate::ports::Collaborators;
use crate::probe::{DatabaseAccess, LiveStateProbe};

/// Collaborators and run settings passed explicitly into the orchestrator
/// and the reset engine.
#[derive(Clone)]
pub struct Runtime {
    collaborators: Collaborators,
    database_access: Option<DatabaseAccess>,
    environment: String,
    sink: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("environment", &self.environment)
            .field("database_access", &self.database_access)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Creates a runtime with no event sink and no database access.
    #[must_use]
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            collaborators,
            database_access: None,
            environment: "default".to_string(),
            sink: Arc::new(NoOpEventSink),
            cancel: Arc::new(CancellationToken::new()),
        }
    }

    /// Enables database lookups in the state probe.
    #[must_use]
    pub fn with_database_access(mut self, access: DatabaseAccess) -> Self {
        self.database_access = Some(access);
        self
    }

    /// Sets the environment id reported with every run.
    #[must_use]
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Shares a cancellation token with the caller.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns the cancellation token checked at stage boundaries.
    #[must_use]
    pub fn cancel_token(&self) -> &Arc<CancellationToken> {
        &self.cancel
    }

    /// Returns the environment id.
    #[must_use]
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Opens a session for one run. Each session has its own credential
    /// cache, so nothing resolved in one run is visible to the next.
    #[must_use]
    pub fn open(&self, pipeline: &str, mode: RunMode) -> RunSession {
        let identity = Arc::new(RunIdentity::new(&self.environment, pipeline, mode));
        let credentials = Arc::new(CredentialResolver::new(self.collaborators.secrets.clone()));
        let mut probe = LiveStateProbe::new(&self.collaborators, credentials.clone());
        if let Some(access) = &self.database_access {
            probe = probe.with_database_access(access.clone());
        }
        let read = ProbeContext::new(Arc::new(probe), credentials, identity.clone())
            .with_vault(self.collaborators.vault.as_ref().map(|v| v.status.clone()));
        let stage = StageContext::new(read, self.collaborators.clone(), self.cancel.clone());
        RunSession {
            identity,
            stage,
            sink: self.sink.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

/// Contexts and sinks for one run.
pub struct RunSession {
    identity: Arc<RunIdentity>,
    stage: StageContext,
    sink: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
}

impl fmt::Debug for RunSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunSession")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl RunSession {
    /// Returns the run identity.
    #[must_use]
    pub fn identity(&self) -> &RunIdentity {
        &self.identity
    }

    /// Returns the read-only context for predicates.
    #[must_use]
    pub fn read(&self) -> &ProbeContext {
        self.stage.read_only()
    }

    /// Returns the full context for apply and teardown.
    #[must_use]
    pub fn stage(&self) -> &StageContext {
        &self.stage
    }

    /// Returns the cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns span attributes for this run.
    #[must_use]
    pub fn span_attributes(&self, stage_count: usize) -> PipelineSpanAttributes {
        PipelineSpanAttributes::for_run(&self.identity).with_stage_count(stage_count)
    }

    /// Emits an event, optionally scoped to a stage.
    pub async fn emit(&self, event_type: EventType, stage: Option<&str>, data: Value) {
        let mut event =
            ProvisionEvent::pipeline(event_type, self.identity.run_id, &self.identity.pipeline)
                .with_data(data);
        if let Some(stage) = stage {
            event = event.for_stage(stage);
        }
        self.sink.emit(&event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::testing::SimulatedEnvironment;

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let env = Arc::new(SimulatedEnvironment::new());
        let sink = Arc::new(CollectingEventSink::new());
        let runtime = Runtime::new(env.collaborators())
            .with_environment("demo")
            .with_event_sink(sink.clone())
            .with_database_access(SimulatedEnvironment::default_access());

        let first = runtime.open("dataspace", RunMode::Provision);
        let second = runtime.open("dataspace", RunMode::Reset);
        assert_ne!(first.identity().run_id, second.identity().run_id);
        assert_eq!(second.identity().mode, RunMode::Reset);
        assert_eq!(first.identity().environment, "demo");

        first
            .emit(EventType::StageSkipped, Some("namespace"), serde_json::json!({}))
            .await;
        assert_eq!(sink.types(), vec![EventType::StageSkipped]);
        assert_eq!(sink.for_stage("namespace").len(), 1);

        runtime.cancel_token().cancel("test");
        assert!(first.cancel_token().is_cancelled());
    }
}
