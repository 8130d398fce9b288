//! Bounded poll-with-backoff waits.
//!
//! Every wait on external readiness has both an iteration bound and a
//! wall-clock budget. Exceeding either yields
//! [`ProvisionError::TimeoutExceeded`], never an unbounded wait.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use crate::errors::ProvisionError;

/// Limits for one bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollBudget {
    /// Delay between checks.
    pub interval: Duration,
    /// Maximum number of checks.
    pub max_polls: u32,
    /// Total wall-clock budget.
    pub budget: Duration,
}

impl Default for PollBudget {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_polls: 30,
            budget: Duration::from_secs(120),
        }
    }
}

impl PollBudget {
    /// Creates a budget.
    #[must_use]
    pub fn new(interval: Duration, max_polls: u32, budget: Duration) -> Self {
        Self {
            interval,
            max_polls: max_polls.max(1),
            budget,
        }
    }

    /// Returns a copy whose iteration bound fits `budget` at this interval.
    #[must_use]
    pub fn spanning(mut self, budget: Duration) -> Self {
        let interval_ms = self.interval.as_millis().max(1);
        let polls = budget.as_millis() / interval_ms + 1;
        self.max_polls = u32::try_from(polls).unwrap_or(u32::MAX);
        self.budget = budget;
        self
    }
}

/// Polls `check` until it returns `Ok(true)`.
///
/// Returns the number of checks performed. Errors from `check` end the wait
/// immediately.
///
/// # Errors
///
/// Returns [`ProvisionError::TimeoutExceeded`] naming `what` when the poll
/// count or the wall-clock budget is exhausted.
pub async fn wait_until<F, Fut>(
    what: &str,
    budget: PollBudget,
    mut check: F,
) -> Result<u32, ProvisionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, ProvisionError>>,
{
    let started = Instant::now();
    let mut polls = 0;

    loop {
        polls += 1;
        if check().await? {
            trace!(what, polls, "Condition reached");
            return Ok(polls);
        }
        let elapsed = started.elapsed();
        if polls >= budget.max_polls || elapsed + budget.interval > budget.budget {
            return Err(ProvisionError::timeout(what, budget.budget));
        }
        trace!(what, polls, "Condition not reached, waiting");
        tokio::time::sleep(budget.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    fn quick(max_polls: u32) -> PollBudget {
        PollBudget::new(Duration::from_millis(1), max_polls, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_wait_until_ready_on_third_poll() {
        let mut calls = 0;
        let polls = wait_until("thing", quick(10), || {
            calls += 1;
            let ready = calls >= 3;
            async move { Ok(ready) }
        })
        .await
        .unwrap();
        assert_eq!(polls, 3);
    }

    #[tokio::test]
    async fn test_wait_until_poll_bound() {
        let mut calls = 0;
        let err = wait_until("postgres", quick(4), || {
            calls += 1;
            async { Ok(false) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls, 4);
        assert_eq!(err.kind(), ErrorKind::TimeoutExceeded);
        assert!(err.to_string().contains("postgres"));
    }

    #[tokio::test]
    async fn test_wait_until_wall_clock_bound() {
        let budget = PollBudget::new(Duration::from_millis(20), 1000, Duration::from_millis(50));
        let mut calls = 0;
        let err = wait_until("slow", budget, || {
            calls += 1;
            async { Ok(false) }
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::TimeoutExceeded);
        assert!(calls <= 3);
    }

    #[tokio::test]
    async fn test_wait_until_propagates_errors() {
        let err = wait_until("broken", quick(10), || async {
            Err(ProvisionError::apply_failed("x", "boom"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ApplyFailed);
    }

    #[test]
    fn test_spanning() {
        let budget = PollBudget::new(Duration::from_secs(2), 1, Duration::from_secs(1))
            .spanning(Duration::from_secs(60));
        assert_eq!(budget.max_polls, 31);
        assert_eq!(budget.budget, Duration::from_secs(60));
    }
}
