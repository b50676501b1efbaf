//! Retry policy with exponential backoff.
//!
//! Wraps an arbitrary fallible async operation. Backoff waits are plain
//! awaits inside the retried future, so an enclosing timeout cancels a
//! pending wait by dropping the future.

use std::future::Future;
use std::time::Duration;

use crate::error::Error;

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Whether to add random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the total number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the delay before the first retry.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Set the upper bound on any single delay.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Decides whether and when to retry a failed operation.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a policy from a configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Access the configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Whether a failed attempt should be retried.
    ///
    /// `attempt` is 1-based; deterministic errors (validation, structural,
    /// disabled) are never retried.
    pub fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        attempt < self.config.max_attempts && error.is_retryable()
    }

    /// Backoff delay before the given (1-based) retry attempt.
    ///
    /// Doubles per attempt from `base_delay`, with optional jitter of up
    /// to one extra `base_delay`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay.as_millis() as u64;
        let multiplier = 2u64.saturating_pow(attempt.saturating_sub(1));
        let mut delay = base.saturating_mul(multiplier);
        if self.config.jitter && base > 0 {
            delay = delay.saturating_add(rand::random::<u64>() % base);
        }
        Duration::from_millis(delay).min(self.config.max_delay)
    }

    /// Drive an operation to success or a terminal failure.
    pub async fn execute_with_retry<T, F, Fut>(&self, mut operation: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(&e, attempt) => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            RetryConfig::new()
                .with_max_attempts(max_attempts)
                .with_base_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(
            RetryConfig::new()
                .with_base_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_millis(350))
                .with_jitter(false),
        );

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350)); // capped
    }

    #[test]
    fn test_should_retry_respects_attempt_budget() {
        let policy = fast_policy(3);
        let err = Error::Execution("reset".into());

        assert!(policy.should_retry(&err, 1));
        assert!(policy.should_retry(&err, 2));
        assert!(!policy.should_retry(&err, 3));
    }

    #[test]
    fn test_should_retry_skips_deterministic_errors() {
        let policy = fast_policy(3);
        assert!(!policy.should_retry(&Error::Validation("empty".into()), 1));
        assert!(!policy.should_retry(&Error::Structural("cycle".into()), 1));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let policy = fast_policy(3);
        let calls = AtomicU32::new(0);

        let result = policy
            .execute_with_retry(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(Error::Execution("transient".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_attempts_then_fails() {
        let policy = fast_policy(2);
        let calls = AtomicU32::new(0);

        let result: Result<(), Error> = policy
            .execute_with_retry(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Execution("persistent".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_validation_errors_fail_immediately() {
        let policy = fast_policy(5);
        let calls = AtomicU32::new(0);

        let result: Result<(), Error> = policy
            .execute_with_retry(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Validation("empty query".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
