//! Circuit breaker guarding the session transport.
//!
//! Stops dispatching calls to a failing dependency until the reset
//! timeout elapses, then admits a bounded number of probes.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::Error;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally; failures are counted.
    Closed,
    /// Calls are rejected without dispatch.
    Open,
    /// A bounded number of probe calls is admitted.
    HalfOpen,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before probing.
    pub reset_timeout: Duration,
    /// Probe calls admitted while half-open.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

impl BreakerConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the consecutive-failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the open-state reset timeout.
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the number of half-open probe calls.
    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }
}

/// Snapshot of breaker counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerStats {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures observed in the current closed window.
    pub failure_count: u32,
    /// Calls rejected while open.
    pub rejected: u64,
    /// Total calls admitted.
    pub admitted: u64,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    half_open_in_flight: u32,
    rejected: u64,
    admitted: u64,
}

/// Process-wide guard for one downstream target.
///
/// Shared by cloning the [`Arc`] it is usually wrapped in; every guarded
/// call mutates the state under one lock.
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a breaker in the closed state.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                half_open_in_flight: 0,
                rejected: 0,
                admitted: 0,
            }),
        }
    }

    /// Create a shared breaker handle.
    pub fn shared(config: BreakerConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    /// Current state, accounting for reset-timeout expiry.
    pub fn state(&self) -> CircuitState {
        let mut guard = self.state.lock();
        self.roll_state(&mut guard);
        guard.state
    }

    /// Run an operation through the breaker.
    ///
    /// Rejects with [`Error::CircuitOpen`] without dispatching when open,
    /// or when the half-open probe budget is spent.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        if !self.try_admit() {
            return Err(Error::CircuitOpen);
        }

        let outcome = operation().await;
        match &outcome {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        outcome
    }

    /// Force the breaker open.
    pub fn force_open(&self) {
        let mut guard = self.state.lock();
        guard.state = CircuitState::Open;
        guard.last_failure = Some(Instant::now());
    }

    /// Force the breaker closed, resetting the failure window.
    pub fn force_close(&self) {
        let mut guard = self.state.lock();
        guard.state = CircuitState::Closed;
        guard.failure_count = 0;
        guard.half_open_in_flight = 0;
    }

    /// Force the breaker half-open.
    pub fn force_half_open(&self) {
        let mut guard = self.state.lock();
        guard.state = CircuitState::HalfOpen;
        guard.half_open_in_flight = 0;
    }

    /// Snapshot the breaker counters.
    pub fn stats(&self) -> BreakerStats {
        let mut guard = self.state.lock();
        self.roll_state(&mut guard);
        BreakerStats {
            state: guard.state,
            failure_count: guard.failure_count,
            rejected: guard.rejected,
            admitted: guard.admitted,
        }
    }

    /// Move Open to HalfOpen once the reset timeout has elapsed.
    fn roll_state(&self, guard: &mut BreakerState) {
        if guard.state == CircuitState::Open {
            let elapsed = guard
                .last_failure
                .map(|t| t.elapsed() >= self.config.reset_timeout)
                .unwrap_or(true);
            if elapsed {
                tracing::debug!("circuit breaker reset timeout elapsed, probing");
                guard.state = CircuitState::HalfOpen;
                guard.half_open_in_flight = 0;
            }
        }
    }

    fn try_admit(&self) -> bool {
        let mut guard = self.state.lock();
        self.roll_state(&mut guard);
        match guard.state {
            CircuitState::Closed => {
                guard.admitted += 1;
                true
            }
            CircuitState::Open => {
                guard.rejected += 1;
                false
            }
            CircuitState::HalfOpen => {
                if guard.half_open_in_flight < self.config.half_open_max_calls {
                    guard.half_open_in_flight += 1;
                    guard.admitted += 1;
                    true
                } else {
                    guard.rejected += 1;
                    false
                }
            }
        }
    }

    fn on_success(&self) {
        let mut guard = self.state.lock();
        if guard.state == CircuitState::HalfOpen {
            tracing::debug!("circuit breaker probe succeeded, closing");
        }
        guard.state = CircuitState::Closed;
        guard.failure_count = 0;
        guard.half_open_in_flight = 0;
    }

    fn on_failure(&self) {
        let mut guard = self.state.lock();
        guard.last_failure = Some(Instant::now());
        match guard.state {
            CircuitState::HalfOpen => {
                tracing::warn!("circuit breaker probe failed, reopening");
                guard.state = CircuitState::Open;
                guard.half_open_in_flight = 0;
            }
            CircuitState::Closed => {
                guard.failure_count += 1;
                if guard.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        failures = guard.failure_count,
                        "failure threshold reached, opening circuit breaker"
                    );
                    guard.state = CircuitState::Open;
                }
            }
            CircuitState::Open => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, reset_ms: u64) -> BreakerConfig {
        BreakerConfig::new()
            .with_failure_threshold(threshold)
            .with_reset_timeout(Duration::from_millis(reset_ms))
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), Error> {
        breaker
            .execute(|| async { Err::<(), _>(Error::Execution("down".into())) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32, Error> {
        breaker.execute(|| async { Ok(7) }).await
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new(config(2, 60_000));
        assert_eq!(breaker.state(), CircuitState::Closed);

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_rejects_without_dispatch() {
        let breaker = CircuitBreaker::new(config(1, 60_000));
        let _ = fail(&breaker).await;

        let result = succeed(&breaker).await;
        assert!(matches!(result, Err(Error::CircuitOpen)));
        assert_eq!(breaker.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_success_resets_failure_window() {
        let breaker = CircuitBreaker::new(config(2, 60_000));

        let _ = fail(&breaker).await;
        let _ = succeed(&breaker).await;
        let _ = fail(&breaker).await;

        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_probe_closes_on_success() {
        let breaker = CircuitBreaker::new(config(1, 5));
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_probe_reopens_on_failure() {
        let breaker = CircuitBreaker::new(config(1, 5));
        let _ = fail(&breaker).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        let _ = fail(&breaker).await;

        assert_eq!(breaker.stats().state, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_forced_transitions() {
        let breaker = CircuitBreaker::new(BreakerConfig::default());

        breaker.force_open();
        assert!(matches!(succeed(&breaker).await, Err(Error::CircuitOpen)));

        breaker.force_half_open();
        assert!(succeed(&breaker).await.is_ok());

        breaker.force_close();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
