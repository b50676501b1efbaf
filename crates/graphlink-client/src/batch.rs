//! Bounded-concurrency batch processing.
//!
//! The single batch primitive the execution core consumes: chunk the
//! input, run each chunk concurrently, keep input order, never drop an
//! item.

use std::future::Future;

use futures::future::join_all;

/// Batch processing options.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Items processed concurrently per chunk.
    pub batch_size: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self { batch_size: 10 }
    }
}

impl BatchOptions {
    /// Create options with the given chunk size (minimum 1).
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }
}

/// Process items in concurrent chunks, preserving input order.
///
/// Each chunk of `batch_size` items runs concurrently; chunks run one
/// after another so at most `batch_size` operations are in flight.
pub async fn process_batches<T, R, F, Fut>(
    items: Vec<T>,
    processor: F,
    options: BatchOptions,
) -> Vec<R>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    let batch_size = options.batch_size.max(1);
    let mut results = Vec::with_capacity(items.len());

    let mut remaining = items;
    while !remaining.is_empty() {
        let chunk: Vec<T> = remaining
            .drain(..batch_size.min(remaining.len()))
            .collect();
        let chunk_results = join_all(chunk.into_iter().map(&processor)).await;
        results.extend(chunk_results);
    }

    results
}
