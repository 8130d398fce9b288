//! Cooperative cancellation checked at stage boundaries.
//!
//! Cancellation is only observed between stages. An apply or teardown that is
//! already in flight runs to completion, so a cancelled run leaves live state
//! unknown: the next run re-evaluates every idempotence check instead of
//! assuming anything was rolled back.

mod token;

pub use token::CancellationToken;
