//! Explicit component wiring for the execution core.
//!
//! There are no static registries: the cache, breaker, monitor, and
//! reporter live in one [`ClientContext`] built at startup and injected
//! into the runner, pipeline, and parallel executor. Shut the context
//! down when the client goes away.

use std::sync::Arc;

use crate::breaker::CircuitBreaker;
use crate::cache::ResultCache;
use crate::error::{ErrorReporter, TracingReporter};
use crate::metrics::PerformanceMonitor;
use crate::parallel::{ParallelConfig, ParallelQueryExecutor};
use crate::pipeline::{PipelineConfig, QueryPipeline};
use crate::runner::{QueryRunner, RunnerConfig};
use crate::session::SessionProvider;

/// Shared components of one client instance.
pub struct ClientContext {
    provider: Arc<dyn SessionProvider>,
    cache: Arc<ResultCache>,
    breaker: Arc<CircuitBreaker>,
    monitor: Arc<PerformanceMonitor>,
    reporter: Arc<dyn ErrorReporter>,
    config: RunnerConfig,
}

impl ClientContext {
    /// Build a context over a session provider, creating the cache,
    /// breaker, and monitor from the configuration.
    pub fn new(provider: Arc<dyn SessionProvider>, config: RunnerConfig) -> Self {
        Self {
            cache: Arc::new(ResultCache::new(config.cache.clone())),
            breaker: CircuitBreaker::shared(config.breaker.clone()),
            monitor: Arc::new(PerformanceMonitor::new()),
            reporter: Arc::new(TracingReporter),
            provider,
            config,
        }
    }

    /// Replace the result cache.
    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Replace the circuit breaker.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    /// Replace the performance monitor.
    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Replace the error reporter.
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// The session provider.
    pub fn provider(&self) -> &Arc<dyn SessionProvider> {
        &self.provider
    }

    /// The shared result cache.
    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// The shared circuit breaker.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// The shared performance monitor.
    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    /// Build a query runner wired to this context's components.
    pub fn runner(&self) -> Arc<QueryRunner> {
        Arc::new(QueryRunner::with_components(
            Arc::clone(&self.provider),
            self.config.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.breaker),
            Arc::clone(&self.monitor),
            Arc::clone(&self.reporter),
        ))
    }

    /// Build a pipeline over a runner from this context.
    pub fn pipeline(&self, config: PipelineConfig) -> QueryPipeline {
        QueryPipeline::new(self.runner(), config)
    }

    /// Build a parallel executor over a runner from this context.
    pub fn parallel_executor(&self, config: ParallelConfig) -> ParallelQueryExecutor {
        ParallelQueryExecutor::new(self.runner(), config)
    }

    /// Release shared state.
    ///
    /// Clears the cache and resets the monitor. The provider owns its
    /// sessions and is dropped with the last handle to it.
    pub async fn shutdown(&self) {
        self.cache.clear().await;
        self.monitor.reset();
        tracing::info!("client context shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::QueryOptions;
    use crate::testutil::MockProvider;

    #[tokio::test]
    async fn test_components_are_shared_across_runners() {
        let context = ClientContext::new(MockProvider::new(), RunnerConfig::default());

        let runner_a = context.runner();
        let runner_b = context.runner();

        runner_a
            .execute("SHOW SPACES", None, &QueryOptions::default())
            .await
            .unwrap();

        // Second runner sees the first runner's cache write.
        let cached = runner_b.cached_result("SHOW SPACES", None).await;
        assert!(cached.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_clears_shared_state() {
        let context = ClientContext::new(MockProvider::new(), RunnerConfig::default());
        let runner = context.runner();

        runner
            .execute("SHOW SPACES", None, &QueryOptions::default())
            .await
            .unwrap();
        context.shutdown().await;

        assert!(runner.cached_result("SHOW SPACES", None).await.is_none());
        assert_eq!(context.monitor().in_flight(), 0);
    }
}
