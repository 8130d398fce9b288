//! Pipeline building and execution.
//!
//! This module provides:
//! - Pipeline definitions and the validating builder
//! - The orchestrator (provisioning runs) and the reset engine
//! - Retry/fallback policy and bounded polling
//! - The catalog of named pipelines and the [`Provisioner`] entry point

mod builder;
mod catalog;
mod orchestrator;
mod poll;
mod provisioner;
mod report;
mod reset;
mod retry;
mod runtime;
mod spec;

#[cfg(test)]
mod integration_tests;

pub use builder::PipelineBuilder;
pub use catalog::{PipelineCatalog, COMMON_SERVICES, CONNECTOR_PREFIX, DATASPACE};
pub use orchestrator::Orchestrator;
pub use poll::{wait_until, PollBudget};
pub use provisioner::Provisioner;
pub use report::{
    FailureDetail, PipelineReport, ResetReport, EXIT_CANCELLED, EXIT_CONFIG, EXIT_FAILED,
    EXIT_PRECONDITION, EXIT_SECRET, EXIT_SUCCESS,
};
pub use reset::ResetEngine;
pub use retry::{
    with_retry, BackoffStrategy, FallbackPolicy, JitterStrategy, RetryPolicy, RetryState,
};
pub use runtime::{RunSession, Runtime};
pub use spec::Pipeline;
