//! Staged query pipeline.
//!
//! A query flows through Validation, Optimization, Transformation,
//! Execution, and Caching, threading one mutable context. Each stage has
//! at most one handler; registering another replaces it. Admission is
//! gated by a semaphore sized to `max_concurrent_pipelines`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Semaphore;

use graphlink_proto::{Params, QueryResult};

use crate::error::Error;
use crate::events::{EventListeners, PipelineEvent};
use crate::query::validate_query;
use crate::runner::{QueryOptions, QueryRequest, QueryRunner};

/// One step of the pipeline's fixed processing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    /// Reject malformed or denylisted queries.
    Validation,
    /// Rewrite the query for execution.
    Optimization,
    /// Reshape parameters or query text.
    Transformation,
    /// Run the query and populate the context result.
    Execution,
    /// Persist the execution result in the cache.
    Caching,
}

impl PipelineStage {
    /// Stages in their declared processing order.
    pub const ORDERED: [PipelineStage; 5] = [
        PipelineStage::Validation,
        PipelineStage::Optimization,
        PipelineStage::Transformation,
        PipelineStage::Execution,
        PipelineStage::Caching,
    ];

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Validation => "validation",
            PipelineStage::Optimization => "optimization",
            PipelineStage::Transformation => "transformation",
            PipelineStage::Execution => "execution",
            PipelineStage::Caching => "caching",
        }
    }
}

/// Mutable state threaded through the stages of one invocation.
///
/// Created at pipeline entry, mutated in place by each handler, and
/// discarded once the call returns.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    /// Query text; rewriting stages may replace it.
    pub query: String,
    /// Query parameters.
    pub params: Option<Params>,
    /// Options forwarded to execution and caching.
    pub options: QueryOptions,
    /// Result populated by the Execution stage (or an earlier one).
    pub result: Option<QueryResult>,
    /// Wall-clock duration each stage took.
    pub stage_timings: HashMap<PipelineStage, Duration>,
    /// Free-form stage-to-stage annotations.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl PipelineContext {
    fn new(query: &str, params: Option<Params>, options: QueryOptions) -> Self {
        Self {
            query: query.to_string(),
            params,
            options,
            result: None,
            stage_timings: HashMap::new(),
            metadata: HashMap::new(),
        }
    }
}

/// Per-stage pipeline logic.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Run this stage over the shared context.
    async fn handle(&self, context: &mut PipelineContext) -> Result<(), Error>;
}

/// Adapter turning a plain synchronous function into a stage handler.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> StageHandler for FnHandler<F>
where
    F: Fn(&mut PipelineContext) -> Result<(), Error> + Send + Sync,
{
    async fn handle(&self, context: &mut PipelineContext) -> Result<(), Error> {
        (self.0)(context)
    }
}

/// Default Validation handler: the denylist check.
struct ValidationStage;

#[async_trait]
impl StageHandler for ValidationStage {
    async fn handle(&self, context: &mut PipelineContext) -> Result<(), Error> {
        if !validate_query(&context.query) {
            return Err(Error::Validation(format!(
                "query rejected: {:?}",
                context.query.chars().take(40).collect::<String>()
            )));
        }
        Ok(())
    }
}

/// Default Execution handler: dispatch through the runner.
///
/// Consults the cache directly when the options ask for it, and runs the
/// session call with runner-side caching off. The Caching stage owns the
/// cache write so it always observes this stage's output.
struct ExecutionStage {
    runner: Arc<QueryRunner>,
}

#[async_trait]
impl StageHandler for ExecutionStage {
    async fn handle(&self, context: &mut PipelineContext) -> Result<(), Error> {
        if context.options.use_cache {
            if let Some(hit) = self
                .runner
                .cached_result(&context.query, context.params.as_ref())
                .await
            {
                context.result = Some(hit);
                return Ok(());
            }
        }

        let options = context.options.clone().with_cache(false);
        let result = self
            .runner
            .execute(&context.query, context.params.as_ref(), &options)
            .await?;
        context.result = Some(result);
        Ok(())
    }
}

/// Default Caching handler: persist a successful result.
struct CachingStage {
    runner: Arc<QueryRunner>,
}

#[async_trait]
impl StageHandler for CachingStage {
    async fn handle(&self, context: &mut PipelineContext) -> Result<(), Error> {
        if !context.options.use_cache {
            return Ok(());
        }
        if let Some(result) = &context.result {
            self.runner
                .store_cached_result(&context.query, result, context.params.as_ref())
                .await;
        }
        Ok(())
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Whether the pipeline accepts invocations.
    pub enabled: bool,
    /// Deadline for one whole invocation.
    pub timeout: Duration,
    /// Invocations admitted concurrently.
    pub max_concurrent_pipelines: usize,
    /// Run data-independent stages concurrently.
    pub parallel_stages: bool,
    /// Record invocation timings on the runner's monitor.
    pub enable_metrics: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_secs(30),
            max_concurrent_pipelines: 10,
            parallel_stages: false,
            enable_metrics: true,
        }
    }
}

impl PipelineConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the pipeline.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the invocation deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the concurrent-invocation cap.
    pub fn with_max_concurrent_pipelines(mut self, max: usize) -> Self {
        self.max_concurrent_pipelines = max;
        self
    }

    /// Enable or disable concurrent data-independent stages.
    pub fn with_parallel_stages(mut self, parallel: bool) -> Self {
        self.parallel_stages = parallel;
        self
    }

    /// Enable or disable metric recording.
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.enable_metrics = enabled;
        self
    }
}

/// Partial configuration update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfigUpdate {
    /// New enabled flag.
    pub enabled: Option<bool>,
    /// New invocation deadline.
    pub timeout: Option<Duration>,
    /// New concurrent-invocation cap.
    pub max_concurrent_pipelines: Option<usize>,
    /// New parallel-stages flag.
    pub parallel_stages: Option<bool>,
    /// New metrics flag.
    pub enable_metrics: Option<bool>,
}

/// Runs queries through the configurable stage sequence.
pub struct QueryPipeline {
    runner: Arc<QueryRunner>,
    config: RwLock<PipelineConfig>,
    handlers: RwLock<HashMap<PipelineStage, Arc<dyn StageHandler>>>,
    gate: RwLock<Arc<Semaphore>>,
    events: EventListeners<PipelineEvent>,
}

impl QueryPipeline {
    /// Create a pipeline with the default stage handlers installed
    /// (Validation, Execution, Caching).
    pub fn new(runner: Arc<QueryRunner>, config: PipelineConfig) -> Self {
        let pipeline = Self::bare(Arc::clone(&runner), config);
        pipeline.register_stage_handler(PipelineStage::Validation, Arc::new(ValidationStage));
        pipeline.register_stage_handler(
            PipelineStage::Execution,
            Arc::new(ExecutionStage {
                runner: Arc::clone(&runner),
            }),
        );
        pipeline.register_stage_handler(PipelineStage::Caching, Arc::new(CachingStage { runner }));
        pipeline
    }

    /// Create a pipeline with no handlers installed.
    pub fn bare(runner: Arc<QueryRunner>, config: PipelineConfig) -> Self {
        let gate = Arc::new(Semaphore::new(config.max_concurrent_pipelines));
        Self {
            runner,
            config: RwLock::new(config),
            handlers: RwLock::new(HashMap::new()),
            gate: RwLock::new(gate),
            events: EventListeners::new(),
        }
    }

    /// Associate a handler with a stage, replacing any prior handler.
    pub fn register_stage_handler(&self, stage: PipelineStage, handler: Arc<dyn StageHandler>) {
        self.handlers.write().insert(stage, handler);
    }

    /// Remove the handler for a stage.
    pub fn unregister_stage_handler(&self, stage: PipelineStage) {
        self.handlers.write().remove(&stage);
    }

    /// Lifecycle event listeners.
    pub fn events(&self) -> &EventListeners<PipelineEvent> {
        &self.events
    }

    /// Apply a partial configuration update.
    ///
    /// Changing the concurrency cap replaces the admission gate; already
    /// running invocations keep their admission.
    pub fn update_config(&self, update: PipelineConfigUpdate) {
        let mut config = self.config.write();
        if let Some(enabled) = update.enabled {
            config.enabled = enabled;
        }
        if let Some(timeout) = update.timeout {
            config.timeout = timeout;
        }
        if let Some(parallel) = update.parallel_stages {
            config.parallel_stages = parallel;
        }
        if let Some(metrics) = update.enable_metrics {
            config.enable_metrics = metrics;
        }
        if let Some(max) = update.max_concurrent_pipelines {
            if max != config.max_concurrent_pipelines {
                config.max_concurrent_pipelines = max;
                *self.gate.write() = Arc::new(Semaphore::new(max));
            }
        }
    }

    /// Run one query through the stages.
    ///
    /// Rejects immediately when disabled or when the admission gate is
    /// saturated. Emits `Started` on entry and exactly one of
    /// `Completed`/`Failed` on exit.
    pub async fn execute(
        &self,
        query: &str,
        params: Option<Params>,
        options: QueryOptions,
    ) -> Result<QueryResult, Error> {
        let (enabled, timeout, parallel, metrics) = {
            let config = self.config.read();
            (
                config.enabled,
                config.timeout,
                config.parallel_stages,
                config.enable_metrics,
            )
        };

        if !enabled {
            return Err(Error::Disabled("query pipeline"));
        }

        let gate = self.gate.read().clone();
        let _permit = gate.try_acquire_owned().map_err(|_| Error::Saturated)?;

        let started = Instant::now();
        self.events.emit(&PipelineEvent::Started {
            query: query.to_string(),
        });

        let op = metrics.then(|| {
            self.runner
                .monitor()
                .start_operation("pipeline.execute", serde_json::json!({ "query": query }))
        });

        let mut context = PipelineContext::new(query, params, options);
        let outcome = match tokio::time::timeout(timeout, self.run_stages(&mut context, parallel))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(timeout)),
        };

        if let Some(op) = op {
            self.runner.monitor().end_operation(op);
        }

        let duration = started.elapsed();
        match outcome {
            Ok(result) => {
                self.events.emit(&PipelineEvent::Completed {
                    query: query.to_string(),
                    duration,
                });
                Ok(result)
            }
            Err(error) => {
                self.events.emit(&PipelineEvent::Failed {
                    query: query.to_string(),
                    error: error.to_string(),
                    duration,
                });
                Err(error)
            }
        }
    }

    /// Run `execute` once per request, returning results in input order.
    ///
    /// Per-entry failures land in that entry's `error` field.
    pub async fn execute_batch(&self, requests: Vec<QueryRequest>) -> Vec<QueryResult> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let started = Instant::now();
            let result = self
                .execute(&request.query, request.params, request.options)
                .await
                .unwrap_or_else(|error| QueryResult {
                    error: Some(error.to_string()),
                    execution_time: started.elapsed(),
                    ..Default::default()
                });
            results.push(result);
        }
        results
    }

    async fn run_stages(
        &self,
        context: &mut PipelineContext,
        parallel: bool,
    ) -> Result<QueryResult, Error> {
        if parallel {
            self.run_preparation_concurrently(context).await?;
            self.run_stage(PipelineStage::Transformation, context).await?;
        } else {
            self.run_stage(PipelineStage::Validation, context).await?;
            self.run_stage(PipelineStage::Optimization, context).await?;
            self.run_stage(PipelineStage::Transformation, context).await?;
        }

        self.run_stage(PipelineStage::Execution, context).await?;
        if context.result.is_none() {
            return Err(Error::NoResult);
        }

        // Caching must observe the execution output, in both modes.
        self.run_stage(PipelineStage::Caching, context).await?;

        context.result.take().ok_or(Error::NoResult)
    }

    /// Validation and Optimization have no data dependency on each other:
    /// run them concurrently on context snapshots, then merge the
    /// optimizer's rewrites back.
    async fn run_preparation_concurrently(
        &self,
        context: &mut PipelineContext,
    ) -> Result<(), Error> {
        let validation = self.handler_for(PipelineStage::Validation);
        let optimization = self.handler_for(PipelineStage::Optimization);

        let mut validation_ctx = context.clone();
        let mut optimization_ctx = context.clone();

        let validate = async {
            match validation {
                Some(handler) => {
                    let started = Instant::now();
                    handler.handle(&mut validation_ctx).await?;
                    Ok(Some(started.elapsed()))
                }
                None => Ok(None),
            }
        };
        let optimize = async {
            match optimization {
                Some(handler) => {
                    let started = Instant::now();
                    handler.handle(&mut optimization_ctx).await?;
                    Ok(Some(started.elapsed()))
                }
                None => Ok(None),
            }
        };

        let (validated, optimized): (Result<_, Error>, Result<_, Error>) =
            futures::join!(validate, optimize);

        if let Some(elapsed) = validated? {
            context.stage_timings.insert(PipelineStage::Validation, elapsed);
        }
        if let Some(elapsed) = optimized? {
            context.stage_timings.insert(PipelineStage::Optimization, elapsed);
            context.query = optimization_ctx.query;
            context.params = optimization_ctx.params;
            context.metadata.extend(optimization_ctx.metadata);
        }
        Ok(())
    }

    async fn run_stage(
        &self,
        stage: PipelineStage,
        context: &mut PipelineContext,
    ) -> Result<(), Error> {
        let Some(handler) = self.handler_for(stage) else {
            return Ok(());
        };

        let started = Instant::now();
        handler.handle(context).await?;
        let elapsed = started.elapsed();
        context.stage_timings.insert(stage, elapsed);
        tracing::debug!(
            stage = stage.as_str(),
            elapsed_us = elapsed.as_micros() as u64,
            "pipeline stage finished"
        );
        Ok(())
    }

    fn handler_for(&self, stage: PipelineStage) -> Option<Arc<dyn StageHandler>> {
        self.handlers.read().get(&stage).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::retry::RetryConfig;
    use crate::runner::RunnerConfig;
    use crate::testutil::MockProvider;
    use parking_lot::Mutex;

    fn runner(provider: Arc<MockProvider>) -> Arc<QueryRunner> {
        Arc::new(QueryRunner::new(
            provider,
            RunnerConfig::new()
                .with_retry(RetryConfig::new().with_max_attempts(1))
                .with_cache(CacheConfig::default()),
        ))
    }

    fn event_log(pipeline: &QueryPipeline) -> Arc<Mutex<Vec<&'static str>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        pipeline.events().subscribe(move |event: &PipelineEvent| {
            sink.lock().push(match event {
                PipelineEvent::Started { .. } => "started",
                PipelineEvent::Completed { .. } => "completed",
                PipelineEvent::Failed { .. } => "failed",
            });
        });
        log
    }

    #[tokio::test]
    async fn test_execute_runs_and_emits_completed_once() {
        let provider = MockProvider::new();
        let pipeline = QueryPipeline::new(runner(provider), PipelineConfig::default());
        let log = event_log(&pipeline);

        let result = pipeline
            .execute("SHOW SPACES", None, QueryOptions::default())
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(log.lock().as_slice(), ["started", "completed"]);
    }

    #[tokio::test]
    async fn test_disabled_pipeline_rejects() {
        let provider = MockProvider::new();
        let pipeline = QueryPipeline::new(
            runner(provider),
            PipelineConfig::new().with_enabled(false),
        );

        let result = pipeline
            .execute("SHOW SPACES", None, QueryOptions::default())
            .await;

        assert!(matches!(result, Err(Error::Disabled(_))));
    }

    #[tokio::test]
    async fn test_missing_execution_handler_yields_no_result() {
        let provider = MockProvider::new();
        let pipeline = QueryPipeline::new(runner(provider), PipelineConfig::default());
        pipeline.unregister_stage_handler(PipelineStage::Execution);
        let log = event_log(&pipeline);

        let result = pipeline
            .execute("SHOW SPACES", None, QueryOptions::default())
            .await;

        assert!(matches!(result, Err(Error::NoResult)));
        assert_eq!(log.lock().as_slice(), ["started", "failed"]);
    }

    #[tokio::test]
    async fn test_validation_failure_emits_failed_once() {
        let provider = MockProvider::new();
        let pipeline = QueryPipeline::new(
            runner(Arc::clone(&provider)),
            PipelineConfig::default(),
        );
        let log = event_log(&pipeline);

        let result = pipeline
            .execute("DROP SPACE prod", None, QueryOptions::default())
            .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(log.lock().as_slice(), ["started", "failed"]);
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_registered_handler_replaces_prior() {
        let provider = MockProvider::new();
        let pipeline = QueryPipeline::new(
            runner(Arc::clone(&provider)),
            PipelineConfig::default(),
        );

        // First registration is clobbered by the second.
        pipeline.register_stage_handler(
            PipelineStage::Optimization,
            Arc::new(FnHandler(|ctx: &mut PipelineContext| {
                ctx.query = "SHOW TAGS".to_string();
                Ok(())
            })),
        );
        pipeline.register_stage_handler(
            PipelineStage::Optimization,
            Arc::new(FnHandler(|ctx: &mut PipelineContext| {
                ctx.query = "SHOW HOSTS".to_string();
                Ok(())
            })),
        );

        pipeline
            .execute("SHOW SPACES", None, QueryOptions::default())
            .await
            .unwrap();

        assert_eq!(provider.calls(), ["SHOW HOSTS"]);
    }

    #[tokio::test]
    async fn test_saturated_gate_rejects() {
        let provider = MockProvider::new();
        let pipeline = QueryPipeline::new(
            runner(provider),
            PipelineConfig::new().with_max_concurrent_pipelines(0),
        );

        let result = pipeline
            .execute("SHOW SPACES", None, QueryOptions::default())
            .await;

        assert!(matches!(result, Err(Error::Saturated)));
    }

    #[tokio::test]
    async fn test_parallel_stages_merge_optimizer_rewrite() {
        let provider = MockProvider::new();
        let pipeline = QueryPipeline::new(
            runner(Arc::clone(&provider)),
            PipelineConfig::new().with_parallel_stages(true),
        );
        pipeline.register_stage_handler(
            PipelineStage::Optimization,
            Arc::new(FnHandler(|ctx: &mut PipelineContext| {
                ctx.query = format!("{} LIMIT 10", ctx.query);
                Ok(())
            })),
        );

        let result = pipeline
            .execute("MATCH (v) RETURN v", None, QueryOptions::default())
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(provider.calls(), ["MATCH (v) RETURN v LIMIT 10"]);
    }

    #[tokio::test]
    async fn test_stage_timings_recorded() {
        let provider = MockProvider::new();
        let pipeline = QueryPipeline::new(runner(provider), PipelineConfig::default());
        let timings = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&timings);

        pipeline.register_stage_handler(
            PipelineStage::Transformation,
            Arc::new(FnHandler(move |ctx: &mut PipelineContext| {
                // Snapshot what earlier stages recorded.
                *sink.lock() = Some(ctx.stage_timings.clone());
                Ok(())
            })),
        );

        pipeline
            .execute("SHOW SPACES", None, QueryOptions::default())
            .await
            .unwrap();

        let seen = timings.lock().clone().unwrap();
        assert!(seen.contains_key(&PipelineStage::Validation));
    }

    #[tokio::test]
    async fn test_batch_keeps_order_and_isolates_failures() {
        let provider = MockProvider::new();
        let pipeline = QueryPipeline::new(runner(provider), PipelineConfig::default());

        let results = pipeline
            .execute_batch(vec![
                QueryRequest::new("SHOW SPACES"),
                QueryRequest::new("TRUNCATE edges"),
            ])
            .await;

        assert_eq!(results.len(), 2);
        assert!(results[0].is_success());
        assert!(!results[1].is_success());
    }

    #[tokio::test]
    async fn test_update_config_toggles_enabled() {
        let provider = MockProvider::new();
        let pipeline = QueryPipeline::new(runner(provider), PipelineConfig::default());

        pipeline.update_config(PipelineConfigUpdate {
            enabled: Some(false),
            ..Default::default()
        });

        let result = pipeline
            .execute("SHOW SPACES", None, QueryOptions::default())
            .await;
        assert!(matches!(result, Err(Error::Disabled(_))));
    }

    #[tokio::test]
    async fn test_caching_stage_populates_cache_for_next_call() {
        let provider = MockProvider::new();
        let pipeline = QueryPipeline::new(
            runner(Arc::clone(&provider)),
            PipelineConfig::default(),
        );

        let first = pipeline
            .execute("SHOW SPACES", None, QueryOptions::default())
            .await
            .unwrap();
        let second = pipeline
            .execute("SHOW SPACES", None, QueryOptions::default())
            .await
            .unwrap();

        assert_eq!(first.data, second.data);
        assert_eq!(provider.call_count(), 1);
    }
}
