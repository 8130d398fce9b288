//! Structured logging setup and span attributes.

mod subscriber;
mod tracing;

pub use subscriber::{env_filter, init_tracing, LogFormat, DEFAULT_FILTER};
pub use tracing::{PipelineSpanAttributes, StageSpanAttributes};
