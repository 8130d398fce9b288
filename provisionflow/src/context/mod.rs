//! Run identity and the contexts handed to stages.

mod execution;
mod identity;

pub use execution::{ProbeContext, StageContext};
pub use identity::{RunIdentity, RunMode};
