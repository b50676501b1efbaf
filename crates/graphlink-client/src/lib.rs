//! GraphLink Client - Query execution core for the GraphLink SDK.
//!
//! This crate turns a query string plus parameters into a result,
//! reliably and efficiently, under concurrent load. It sits between
//! application code and a pooled-session transport and composes five
//! concerns: parameter handling, TTL result caching, retry and
//! circuit-breaker resilience, a staged execution pipeline, and
//! dependency-aware parallel scheduling.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use graphlink_client::{ClientContext, QueryOptions, RunnerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Any transport implementing `SessionProvider` plugs in here.
//!     let provider = Arc::new(my_transport::Pool::connect("graphlink://localhost").await?);
//!
//!     let context = ClientContext::new(provider, RunnerConfig::default());
//!     let runner = context.runner();
//!
//!     let result = runner
//!         .execute("MATCH (v:person) RETURN v LIMIT 10", None, &QueryOptions::default())
//!         .await?;
//!     println!("{} rows in {:?}", result.len(), result.execution_time);
//!
//!     context.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod breaker;
pub mod cache;
pub mod context;
pub mod error;
pub mod events;
pub mod metrics;
pub mod parallel;
pub mod pipeline;
pub mod query;
pub mod retry;
pub mod runner;
pub mod session;

#[cfg(test)]
pub(crate) mod testutil;

pub use batch::{process_batches, BatchOptions};
pub use breaker::{BreakerConfig, BreakerStats, CircuitBreaker, CircuitState};
pub use cache::{
    cache_key, CacheBackend, CacheConfig, CacheConfigUpdate, CacheEntry, CacheStats,
    MemoryBackend, ResultCache,
};
pub use context::ClientContext;
pub use error::{Error, ErrorContext, ErrorReporter, TracingReporter};
pub use events::{EventListeners, PipelineEvent, TaskEvent};
pub use metrics::{LatencyHistogram, OperationId, PerformanceMonitor};
pub use parallel::{
    ExecutorStats, ParallelConfig, ParallelQueryExecutor, ParallelQueryResult, QueryTask,
    TaskStatus,
};
pub use pipeline::{
    FnHandler, PipelineConfig, PipelineConfigUpdate, PipelineContext, PipelineStage,
    QueryPipeline, StageHandler,
};
pub use query::{
    detect_query_type, escape_properties, escape_value, interpolate_params, validate_query,
    QueryType,
};
pub use retry::{RetryConfig, RetryPolicy};
pub use runner::{QueryOptions, QueryRequest, QueryRunner, RunnerConfig, RunnerStats};
pub use session::{Session, SessionProvider};

/// Re-export protocol types.
pub use graphlink_proto as proto;
