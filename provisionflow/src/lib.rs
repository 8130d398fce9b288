//! # Provisionflow
//!
//! Idempotent, dependency-ordered provisioning and reset of a multi-tenant
//! dataspace: shared services, a dataspace with its registration service,
//! and any number of connectors.
//!
//! Provisionflow provides a structured approach to environment provisioning
//! with support for:
//!
//! - **Stage-based execution**: discrete stages with read-only predicates, an
//!   idempotent `apply`, and a destructive `teardown`
//! - **Two-tier recovery**: bounded retries of the same action, then a single
//!   degraded fallback with a longer timeout
//! - **Reverse-order reset**: teardown that treats "already absent" as success
//! - **Live credentials**: every secret resolved from current state, cached
//!   only for one run
//! - **Event-driven observability**: lifecycle events and `tracing` spans
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use provisionflow::prelude::*;
//!
//! let config = EnvironmentConfig::load(Path::new("environment.yaml"))?;
//! let provisioner = Provisioner::new(&config, collaborators)?;
//!
//! let report = provisioner.run("dataspace").await?;
//! println!("{}", report.summary());
//! std::process::exit(report.exit_code());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod context;
pub mod core;
pub mod credentials;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod ports;
pub mod probe;
pub mod stages;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{EnvironmentConfig, ResourceNames};
    pub use crate::context::{ProbeContext, RunIdentity, RunMode, StageContext};
    pub use crate::core::{ReadinessRule, ResourceRef, SecretValue, StageKind, StageOutcome};
    pub use crate::credentials::{CredentialResolver, SecretRef};
    pub use crate::errors::{
        CollaboratorError, ConfigError, ErrorKind, PipelineValidationError, ProvisionError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{
        FallbackPolicy, Orchestrator, Pipeline, PipelineBuilder, PipelineCatalog,
        PipelineReport, PollBudget, Provisioner, ResetEngine, ResetReport, RetryPolicy, Runtime,
    };
    pub use crate::ports::{
        ClusterClient, Collaborators, DatabaseAdmin, ReleaseManager, SecretStore,
    };
    pub use crate::probe::StateProbe;
    pub use crate::stages::{ApplyMode, Condition, Stage, StageBaseExt, StageResult};
}
