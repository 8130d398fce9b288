//! Testing utilities for provisioning pipelines.
//!
//! This module provides:
//! - An in-memory environment implementing every collaborator capability
//! - Scripted stages for orchestrator and reset property tests
//! - Report assertions and a context harness

mod assertions;
mod fixtures;
mod mocks;
mod simulated;

pub use assertions::{
    assert_all_skipped, assert_failed_at, assert_not_attempted, assert_outcomes,
    assert_run_succeeded,
};
pub use fixtures::TestHarness;
pub use mocks::{ApplyStep, CallLog, ScriptedStage};
pub use simulated::{ChartEffects, SimulatedEnvironment};
