//! Query runner: single and batch execution against a pooled session.
//!
//! One `execute` call leases a session, consults the cache, wraps the
//! transport call in the retry policy and circuit breaker, formats the
//! raw response, and records metrics. Sessions are released on every
//! exit path, including timeouts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::json;

use graphlink_proto::{Params, QueryResult, RawResult};

use crate::batch::{process_batches, BatchOptions};
use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::cache::{CacheConfig, ResultCache};
use crate::error::{Error, ErrorContext, ErrorReporter, TracingReporter};
use crate::metrics::PerformanceMonitor;
use crate::query::{detect_query_type, validate_query, QueryType};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::session::SessionProvider;

/// Query runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Deadline applied to a session call when the options carry none.
    pub default_timeout: Duration,
    /// Master switch for result caching.
    pub enable_cache: bool,
    /// Cache configuration used when the runner builds its own cache.
    pub cache: CacheConfig,
    /// Retry policy configuration.
    pub retry: RetryConfig,
    /// Circuit breaker configuration.
    pub breaker: BreakerConfig,
    /// Concurrency bound for `execute_batch`.
    pub batch_size: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            enable_cache: true,
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            batch_size: 10,
        }
    }
}

impl RunnerConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default session-call timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Enable or disable result caching.
    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.enable_cache = enabled;
        self
    }

    /// Set the cache configuration.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Set the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the breaker configuration.
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Set the batch concurrency bound.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// Per-call execution options.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Whether to consult and populate the result cache.
    pub use_cache: bool,
    /// Space to scope the leased session to.
    pub space: Option<String>,
    /// Per-call deadline override.
    pub timeout: Option<Duration>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            space: None,
            timeout: None,
        }
    }
}

impl QueryOptions {
    /// Create options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the cache for this call.
    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    /// Scope the call to a space.
    pub fn with_space(mut self, space: impl Into<String>) -> Self {
        self.space = Some(space.into());
        self
    }

    /// Override the deadline for this call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One entry of an `execute_batch` call.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// Query text.
    pub query: String,
    /// Optional parameters.
    pub params: Option<Params>,
    /// Per-call options.
    pub options: QueryOptions,
}

impl QueryRequest {
    /// Create a request with default options.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            params: None,
            options: QueryOptions::default(),
        }
    }

    /// Attach parameters.
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = Some(params);
        self
    }

    /// Attach options.
    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }
}

/// Cumulative runner statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerStats {
    /// Queries attempted, including eagerly rejected ones.
    pub total_queries: u64,
    /// Queries that returned a successful result.
    pub successful_queries: u64,
    /// Queries that failed.
    pub failed_queries: u64,
    /// Lookups answered from the cache.
    pub cache_hits: u64,
    /// Lookups that fell through to the transport.
    pub cache_misses: u64,
    /// Total time spent executing against sessions.
    pub total_execution_time: Duration,
    /// Mean session execution time.
    pub average_execution_time: Duration,
    /// Executed statements per detected type.
    pub by_type: HashMap<QueryType, u64>,
}

/// Executes queries against the pooled session transport.
pub struct QueryRunner {
    provider: Arc<dyn SessionProvider>,
    cache: Arc<ResultCache>,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    monitor: Arc<PerformanceMonitor>,
    reporter: Arc<dyn ErrorReporter>,
    config: RunnerConfig,
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    execution_us: AtomicU64,
    executed: AtomicU64,
    by_type: RwLock<HashMap<QueryType, u64>>,
}

impl QueryRunner {
    /// Create a runner owning its cache, breaker, and monitor.
    pub fn new(provider: Arc<dyn SessionProvider>, config: RunnerConfig) -> Self {
        let cache = Arc::new(ResultCache::new(config.cache.clone()));
        let breaker = CircuitBreaker::shared(config.breaker.clone());
        Self::with_components(
            provider,
            config,
            cache,
            breaker,
            Arc::new(PerformanceMonitor::new()),
            Arc::new(TracingReporter),
        )
    }

    /// Create a runner around externally owned components.
    pub fn with_components(
        provider: Arc<dyn SessionProvider>,
        config: RunnerConfig,
        cache: Arc<ResultCache>,
        breaker: Arc<CircuitBreaker>,
        monitor: Arc<PerformanceMonitor>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let retry = RetryPolicy::new(config.retry.clone());
        Self {
            provider,
            cache,
            retry,
            breaker,
            monitor,
            reporter,
            config,
            total: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            execution_us: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            by_type: RwLock::new(HashMap::new()),
        }
    }

    /// The cache this runner consults.
    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// The breaker guarding this runner's transport calls.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// The monitor recording this runner's timings.
    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    /// Execute one query.
    ///
    /// Validation failures are rejected before any session is leased.
    /// Transport failures are retried per policy and reported before
    /// being returned; this method never swallows an execution failure.
    pub async fn execute(
        &self,
        query: &str,
        params: Option<&Params>,
        options: &QueryOptions,
    ) -> Result<QueryResult, Error> {
        let started = Instant::now();
        self.total.fetch_add(1, Ordering::Relaxed);

        if !validate_query(query) {
            self.failed.fetch_add(1, Ordering::Relaxed);
            let error = Error::Validation(format!(
                "query rejected: {:?}",
                query.chars().take(40).collect::<String>()
            ));
            self.report(&error, "execute", query, started.elapsed());
            return Err(error);
        }

        let query_type = detect_query_type(query);
        *self.by_type.write().entry(query_type).or_insert(0) += 1;

        let use_cache = options.use_cache && self.config.enable_cache && self.cache.is_enabled();
        if use_cache {
            if let Some(hit) = self.cache.get(query, params).await {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                self.successful.fetch_add(1, Ordering::Relaxed);
                return Ok(hit);
            }
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let op = self
            .monitor
            .start_operation("runner.execute", json!({ "type": query_type.as_str() }));
        let timeout = options.timeout.unwrap_or(self.config.default_timeout);
        let outcome = self.dispatch(query, params, options.space.as_deref(), timeout).await;
        let elapsed = self.monitor.end_operation(op).unwrap_or_else(|| started.elapsed());

        self.executed.fetch_add(1, Ordering::Relaxed);
        self.execution_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);

        match outcome {
            Ok(raw) => {
                let result = QueryResult::from_raw(raw, elapsed);
                self.successful.fetch_add(1, Ordering::Relaxed);
                if use_cache {
                    self.cache.set(query, &result, params).await;
                }
                Ok(result)
            }
            Err(error) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.report(&error, "execute", query, elapsed);
                Err(error)
            }
        }
    }

    /// Execute a list of requests with bounded concurrency.
    ///
    /// Returns one result per request in input order. A request's failure
    /// lands in its own result's `error` field; siblings are unaffected.
    pub async fn execute_batch(&self, requests: Vec<QueryRequest>) -> Vec<QueryResult> {
        process_batches(
            requests,
            |request| async move {
                let started = Instant::now();
                match self
                    .execute(&request.query, request.params.as_ref(), &request.options)
                    .await
                {
                    Ok(result) => result,
                    Err(error) => QueryResult {
                        error: Some(error.to_string()),
                        execution_time: started.elapsed(),
                        ..Default::default()
                    },
                }
            },
            BatchOptions::new(self.config.batch_size),
        )
        .await
    }

    /// Look up a cached result, honoring the enabled switch.
    pub async fn cached_result(&self, query: &str, params: Option<&Params>) -> Option<QueryResult> {
        if !self.config.enable_cache {
            return None;
        }
        self.cache.get(query, params).await
    }

    /// Store a result in the cache, honoring the enabled switch.
    pub async fn store_cached_result(
        &self,
        query: &str,
        result: &QueryResult,
        params: Option<&Params>,
    ) {
        if !self.config.enable_cache {
            return;
        }
        self.cache.set(query, result, params).await;
    }

    /// Snapshot the cumulative counters.
    pub fn stats(&self) -> RunnerStats {
        let executed = self.executed.load(Ordering::Relaxed);
        let total_execution_time =
            Duration::from_micros(self.execution_us.load(Ordering::Relaxed));
        RunnerStats {
            total_queries: self.total.load(Ordering::Relaxed),
            successful_queries: self.successful.load(Ordering::Relaxed),
            failed_queries: self.failed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            total_execution_time,
            average_execution_time: if executed > 0 {
                total_execution_time / executed as u32
            } else {
                Duration::ZERO
            },
            by_type: self.by_type.read().clone(),
        }
    }

    /// Run the session call inside the retry and breaker wrappers.
    ///
    /// The deadline covers the session call only; the lease is returned
    /// on every path, including when the deadline fires.
    async fn dispatch(
        &self,
        query: &str,
        params: Option<&Params>,
        space: Option<&str>,
        timeout: Duration,
    ) -> Result<RawResult, Error> {
        self.retry
            .execute_with_retry(|| async move {
                self.breaker
                    .execute(|| async move {
                        let session = self.provider.get_session(space).await?;
                        let outcome =
                            tokio::time::timeout(timeout, session.execute(query, params)).await;
                        self.provider.release_session(session).await;

                        match outcome {
                            Ok(Ok(raw)) => match raw.error {
                                Some(message) => Err(Error::Execution(message)),
                                None => Ok(raw),
                            },
                            Ok(Err(error)) => Err(error),
                            Err(_) => Err(Error::Timeout(timeout)),
                        }
                    })
                    .await
            })
            .await
    }

    fn report(&self, error: &Error, operation: &'static str, query: &str, elapsed: Duration) {
        self.reporter.report(
            error,
            &ErrorContext::new("query_runner", operation)
                .with_query(query)
                .with_elapsed(elapsed),
        );
    }
}
