//! Client error types and the error reporting seam.

use std::time::Duration;

use thiserror::Error;

/// Execution core errors.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Query text rejected before dispatch.
    #[error("validation error: {0}")]
    Validation(String),

    /// Defective task graph (cycle, missing or failed dependency).
    #[error("structural error: {0}")]
    Structural(String),

    /// Session or transport failure while executing.
    #[error("execution error: {0}")]
    Execution(String),

    /// A stage, pipeline, or session call exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Operation attempted while the owning component is disabled.
    #[error("{0} is disabled")]
    Disabled(&'static str),

    /// Admission gate is saturated.
    #[error("too many concurrent pipelines")]
    Saturated,

    /// Circuit breaker is refusing calls.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// Session acquisition failed.
    #[error("session pool error: {0}")]
    Pool(String),

    /// Pipeline finished without any stage producing a result.
    #[error("pipeline produced no result")]
    NoResult,

    /// Cache backend fault (reported, then degraded to a miss).
    #[error("cache backend error: {0}")]
    CacheBackend(String),
}

impl Error {
    /// Whether a retry could plausibly succeed.
    ///
    /// Validation, structural, and disabled errors are deterministic;
    /// retrying them only repeats the refusal. An open breaker is retried
    /// so that a later attempt can pass once the reset timeout elapses.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Execution(_) | Error::Timeout(_) | Error::Pool(_) | Error::CircuitOpen
        )
    }
}

/// Context attached to a reported error.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Component that observed the failure.
    pub component: &'static str,
    /// Operation that was in flight.
    pub operation: &'static str,
    /// Leading fragment of the query text, if relevant.
    pub query_prefix: Option<String>,
    /// Time spent before the failure surfaced.
    pub elapsed: Option<Duration>,
}

impl ErrorContext {
    /// Create a context for a component/operation pair.
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            query_prefix: None,
            elapsed: None,
        }
    }

    /// Attach the leading fragment of the query text.
    pub fn with_query(mut self, query: &str) -> Self {
        self.query_prefix = Some(query.chars().take(80).collect());
        self
    }

    /// Attach the elapsed time.
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(elapsed);
        self
    }
}

/// Sink for errors the core reports but does not necessarily propagate.
///
/// Injected at construction so callers can route failures into their own
/// telemetry. The default implementation logs through `tracing`.
pub trait ErrorReporter: Send + Sync {
    /// Report an error with its context.
    fn report(&self, error: &Error, context: &ErrorContext);
}

/// Default reporter that logs through the `tracing` facade.
#[derive(Debug, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, error: &Error, context: &ErrorContext) {
        tracing::error!(
            component = context.component,
            operation = context.operation,
            query = context.query_prefix.as_deref().unwrap_or(""),
            elapsed_ms = context.elapsed.map(|e| e.as_millis() as u64),
            error = %error,
            "operation failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Execution("connection reset".into()).is_retryable());
        assert!(Error::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(Error::Pool("exhausted".into()).is_retryable());
        assert!(Error::CircuitOpen.is_retryable());

        assert!(!Error::Validation("empty query".into()).is_retryable());
        assert!(!Error::Structural("cycle".into()).is_retryable());
        assert!(!Error::Disabled("pipeline").is_retryable());
        assert!(!Error::NoResult.is_retryable());
    }

    #[test]
    fn test_context_query_prefix_is_truncated() {
        let long = "MATCH ".repeat(50);
        let ctx = ErrorContext::new("runner", "execute").with_query(&long);
        assert_eq!(ctx.query_prefix.unwrap().chars().count(), 80);
    }

    #[test]
    fn test_error_display() {
        let err = Error::Disabled("cache");
        assert_eq!(err.to_string(), "cache is disabled");

        let err = Error::Validation("empty query".into());
        assert_eq!(err.to_string(), "validation error: empty query");
    }
}
