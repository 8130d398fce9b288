//! Core types for provisionflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Stage kinds, lifecycle states and outcomes
//! - Resource references and observed resource state
//! - Redacted secret values

mod resource;
mod secret;
mod status;

pub use resource::{
    ContainerStatus, ExternalSystem, PodStatus, ReadinessRule, Resource, ResourceRef,
    WorkloadStatus, CRASH_LOOP_SIGNATURES,
};
pub use secret::SecretValue;
pub use status::{StageKind, StageOutcome, StageState, StageTracker};
