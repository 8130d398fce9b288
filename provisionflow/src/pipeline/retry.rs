//! Two-tier retry policy: same-action retries with backoff, then at most one
//! degraded fallback attempt.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^retry
    #[default]
    Exponential,
    /// delay = base * (retry + 1)
    Linear,
    /// delay = base
    Constant,
}

/// Jitter applied on top of the backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter.
    #[default]
    None,
    /// Random from 0 to delay.
    Full,
    /// Half fixed, half random.
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

/// The degraded second tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackPolicy {
    /// Timeout granted to the fallback action, typically much longer than the primary.
    pub timeout: Duration,
    /// Whether to tear down the partial result of the primary attempts first.
    pub teardown_first: bool,
}

impl FallbackPolicy {
    /// Creates a fallback with the given timeout that tears down first.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            teardown_first: true,
        }
    }

    /// Sets whether the partial result is torn down before the fallback runs.
    #[must_use]
    pub fn with_teardown_first(mut self, teardown_first: bool) -> Self {
        self.teardown_first = teardown_first;
        self
    }
}

/// Retry and fallback policy for one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum primary `apply` invocations, including the first.
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    pub jitter_strategy: JitterStrategy,
    /// Timeout granted to each primary `apply`.
    pub apply_timeout: Duration,
    /// Optional degraded second tier.
    pub fallback: Option<FallbackPolicy>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
            max_delay_ms: 30_000,
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::None,
            apply_timeout: Duration::from_secs(300),
            fallback: None,
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A single attempt with no delay and no fallback.
    #[must_use]
    pub fn once() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Sets the maximum attempts. Values below one are raised to one.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }

    /// Sets the primary apply timeout.
    #[must_use]
    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }

    /// Sets the fallback tier.
    #[must_use]
    pub fn with_fallback(mut self, fallback: FallbackPolicy) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Returns true if a fallback tier is configured.
    #[must_use]
    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

/// Tracks delays across retries of one stage.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Retries taken so far (0 before the first retry).
    pub retries: u32,
    previous_delay_ms: Option<u64>,
}

impl RetryState {
    /// Creates a fresh state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the delay before the next retry and advances the counter.
    pub fn next_delay(&mut self, policy: &RetryPolicy) -> Duration {
        let delay = self.calculate_delay(policy);
        self.retries += 1;
        delay
    }

    /// Calculates the delay for the current retry without advancing.
    #[must_use]
    pub fn calculate_delay(&mut self, policy: &RetryPolicy) -> Duration {
        let base = policy.base_delay_ms;
        let max = policy.max_delay_ms;
        let retries = self.retries;

        let delay = match policy.backoff_strategy {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(retries)).min(max),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(retries) + 1).min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match policy.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let prev = self.previous_delay_ms.unwrap_or(base);
                let upper = prev.saturating_mul(3).min(max);
                let next = if upper <= base {
                    base
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                };
                self.previous_delay_ms = Some(next);
                next
            }
        };

        Duration::from_millis(jittered)
    }

    /// Returns true if the primary tier has no attempts left after `attempts` invocations.
    #[must_use]
    pub fn is_exhausted(attempts: u32, policy: &RetryPolicy) -> bool {
        attempts >= policy.max_attempts
    }
}

/// Runs an operation up to `policy.max_attempts` times, sleeping between
/// attempts while `is_retryable` holds for the error.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut state = RetryState::new();
    let mut attempts = 0;

    loop {
        attempts += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if !is_retryable(&err) || RetryState::is_exhausted(attempts, policy) {
                    return Err(err);
                }
                let delay = state.next_delay(policy);
                tracing::debug!(
                    operation = label,
                    attempt = attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Retrying after error"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.apply_timeout, Duration::from_secs(300));
        assert!(!policy.has_fallback());
        assert_eq!(RetryPolicy::once().max_attempts, 1);
        assert_eq!(RetryPolicy::new().with_max_attempts(0).max_attempts, 1);
    }

    #[test]
    fn test_fallback_builder() {
        let policy = RetryPolicy::new().with_fallback(
            FallbackPolicy::new(Duration::from_secs(1200)).with_teardown_first(false),
        );
        let fallback = policy.fallback.unwrap();
        assert_eq!(fallback.timeout, Duration::from_secs(1200));
        assert!(!fallback.teardown_first);
    }

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::new().with_base_delay_ms(100);
        let mut state = RetryState::new();
        assert_eq!(state.next_delay(&policy), Duration::from_millis(100));
        assert_eq!(state.next_delay(&policy), Duration::from_millis(200));
        assert_eq!(state.next_delay(&policy), Duration::from_millis(400));
        assert_eq!(state.retries, 3);
    }

    #[test]
    fn test_linear_and_constant_delays() {
        let linear = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Linear);
        let mut state = RetryState::new();
        state.retries = 2;
        assert_eq!(state.calculate_delay(&linear), Duration::from_millis(300));

        let constant = linear.with_backoff(BackoffStrategy::Constant);
        state.retries = 7;
        assert_eq!(state.calculate_delay(&constant), Duration::from_millis(100));
    }

    #[test]
    fn test_delay_capped() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(1000)
            .with_max_delay_ms(5000);
        let mut state = RetryState::new();
        state.retries = 10;
        assert_eq!(state.calculate_delay(&policy), Duration::from_millis(5000));
    }

    #[test]
    fn test_full_jitter_bounded() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant)
            .with_jitter(JitterStrategy::Full);
        let mut state = RetryState::new();
        for _ in 0..10 {
            assert!(state.calculate_delay(&policy) <= Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn test_with_retry_stops_at_max_attempts() {
        let policy = RetryPolicy::new().with_max_attempts(3).with_base_delay_ms(1);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), String> = with_retry(&policy, "test", |_| true, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("always fails".to_string())
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_not_retryable() {
        let policy = RetryPolicy::new().with_max_attempts(5).with_base_delay_ms(1);
        let mut calls = 0;

        let result: Result<(), &str> = with_retry(&policy, "test", |_| false, || {
            calls += 1;
            async { Err("structural") }
        })
        .await;

        assert_eq!(result, Err("structural"));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_with_retry_recovers() {
        let policy = RetryPolicy::new().with_max_attempts(5).with_base_delay_ms(1);
        let mut calls = 0;

        let result: Result<u32, String> = with_retry(&policy, "test", |_| true, || {
            calls += 1;
            let current = calls;
            async move {
                if current < 3 {
                    Err(format!("attempt {current}"))
                } else {
                    Ok(current)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
    }
}
