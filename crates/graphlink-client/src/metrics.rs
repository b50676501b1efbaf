//! Performance monitoring for query execution.
//!
//! Tracks in-flight operations and a lock-free latency histogram. All
//! counters are atomics; recording never blocks a query.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

/// Handle for an operation started on the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationId(u64);

struct InFlight {
    name: String,
    meta: Value,
    started: Instant,
}

/// Fixed-bucket latency histogram.
///
/// Bucket boundaries are microseconds; each bucket counts observations at
/// or under its boundary. Observation is lock-free.
pub struct LatencyHistogram {
    boundaries: &'static [u64],
    counts: Vec<AtomicU64>,
    sum_us: AtomicU64,
    count: AtomicU64,
    max_us: AtomicU64,
}

/// 100us, 1ms, 10ms, 100ms, 1s, 10s.
const LATENCY_BOUNDARIES: &[u64] = &[100, 1_000, 10_000, 100_000, 1_000_000, 10_000_000];

impl LatencyHistogram {
    /// Create an empty histogram with the default boundaries.
    pub fn new() -> Self {
        Self {
            boundaries: LATENCY_BOUNDARIES,
            counts: LATENCY_BOUNDARIES
                .iter()
                .map(|_| AtomicU64::new(0))
                .collect(),
            sum_us: AtomicU64::new(0),
            count: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
        }
    }

    /// Record one observation.
    pub fn observe(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);

        let idx = self
            .boundaries
            .iter()
            .position(|&b| us <= b)
            .unwrap_or(self.boundaries.len() - 1);
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Number of observations.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of all observations.
    pub fn total(&self) -> Duration {
        Duration::from_micros(self.sum_us.load(Ordering::Relaxed))
    }

    /// Mean observation, zero when empty.
    pub fn avg(&self) -> Duration {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.sum_us.load(Ordering::Relaxed) / count)
    }

    /// Largest observation.
    pub fn max(&self) -> Duration {
        Duration::from_micros(self.max_us.load(Ordering::Relaxed))
    }

    /// Upper boundary of the bucket holding the given percentile.
    pub fn percentile(&self, p: f64) -> Duration {
        let total = self.count.load(Ordering::Relaxed);
        if total == 0 {
            return Duration::ZERO;
        }

        let target = (total as f64 * p).ceil() as u64;
        let mut cumulative = 0u64;
        for (i, count) in self.counts.iter().enumerate() {
            cumulative += count.load(Ordering::Relaxed);
            if cumulative >= target {
                return Duration::from_micros(self.boundaries[i]);
            }
        }
        Duration::from_micros(*self.boundaries.last().unwrap_or(&0))
    }

    /// Reset every counter.
    pub fn reset(&self) {
        self.sum_us.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);
        self.max_us.store(0, Ordering::Relaxed);
        for count in &self.counts {
            count.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Collects operation timings for the execution core.
pub struct PerformanceMonitor {
    next_id: AtomicU64,
    in_flight: DashMap<u64, InFlight>,
    query_latency: LatencyHistogram,
}

impl PerformanceMonitor {
    /// Create an empty monitor.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            in_flight: DashMap::new(),
            query_latency: LatencyHistogram::new(),
        }
    }

    /// Begin timing a named operation.
    pub fn start_operation(&self, name: impl Into<String>, meta: Value) -> OperationId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.in_flight.insert(
            id,
            InFlight {
                name: name.into(),
                meta,
                started: Instant::now(),
            },
        );
        OperationId(id)
    }

    /// Finish a started operation, recording and returning its duration.
    ///
    /// Returns `None` for an unknown or already-ended id.
    pub fn end_operation(&self, id: OperationId) -> Option<Duration> {
        let (_, op) = self.in_flight.remove(&id.0)?;
        let elapsed = op.started.elapsed();
        tracing::debug!(
            operation = %op.name,
            meta = %op.meta,
            elapsed_us = elapsed.as_micros() as u64,
            "operation finished"
        );
        self.query_latency.observe(elapsed);
        Some(elapsed)
    }

    /// Record a query execution timed externally.
    pub fn record_query_execution(&self, duration: Duration) {
        self.query_latency.observe(duration);
    }

    /// Number of operations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// The latency histogram across all recorded operations.
    pub fn latency(&self) -> &LatencyHistogram {
        &self.query_latency
    }

    /// Drop in-flight operations and reset the histogram.
    pub fn reset(&self) {
        self.in_flight.clear();
        self.query_latency.reset();
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}
