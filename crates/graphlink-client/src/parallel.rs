//! Parallel query executor.
//!
//! Runs a batch of query tasks concurrently under a global concurrency
//! cap, honoring per-task priority and declared dependencies. Structural
//! defects (cycles, missing dependencies) are detected before anything is
//! dispatched; affected tasks resolve as failed without execution.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;

use graphlink_proto::{Params, QueryResult};

use crate::error::Error;
use crate::events::{EventListeners, TaskEvent};
use crate::runner::{QueryOptions, QueryRunner};

/// One schedulable query task.
#[derive(Debug, Clone)]
pub struct QueryTask {
    /// Identifier, unique within a batch.
    pub id: String,
    /// Query text.
    pub query: String,
    /// Optional parameters.
    pub params: Option<Params>,
    /// Scheduling priority; higher runs first. Defaults to 0.
    pub priority: i32,
    /// Ids of tasks that must complete before this one starts.
    pub dependencies: Vec<String>,
    /// Per-task execution options.
    pub options: QueryOptions,
}

impl QueryTask {
    /// Create a task with default priority and no dependencies.
    pub fn new(id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            query: query.into(),
            params: None,
            priority: 0,
            dependencies: Vec::new(),
            options: QueryOptions::default(),
        }
    }

    /// Attach parameters.
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = Some(params);
        self
    }

    /// Set the scheduling priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Declare dependencies by task id.
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// Attach execution options.
    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }
}

/// Outcome of one submitted task; exactly one exists per task.
#[derive(Debug, Clone)]
pub struct ParallelQueryResult {
    /// Id of the submitted task.
    pub task_id: String,
    /// Result when the task executed successfully.
    pub result: Option<QueryResult>,
    /// Rendered error when it did not.
    pub error: Option<String>,
    /// When processing of the task began.
    pub started_at: Instant,
    /// When processing of the task finished.
    pub finished_at: Instant,
    /// Wall-clock processing time.
    pub execution_time: Duration,
}

impl ParallelQueryResult {
    /// Whether the task produced a result.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    fn structural(task_id: String, error: &Error) -> Self {
        let now = Instant::now();
        Self {
            task_id,
            result: None,
            error: Some(error.to_string()),
            started_at: now,
            finished_at: now,
            execution_time: Duration::ZERO,
        }
    }
}

/// Resolution state of a task id, queryable after a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// The task produced a result.
    Completed,
    /// The task failed, structurally or at execution.
    Failed,
    /// The id was never part of a finished task.
    NotFound,
}

/// Parallel executor configuration.
#[derive(Debug, Clone)]
pub struct ParallelConfig {
    /// Tasks allowed in flight at once.
    pub max_concurrency: usize,
    /// Deadline applied to a task when its options carry none.
    pub timeout: Duration,
    /// Whether failed tasks are retried.
    pub retry_failed_tasks: bool,
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    /// Wait between attempts.
    pub retry_delay: Duration,
    /// Whether task dependencies are resolved and enforced.
    pub enable_dependency_resolution: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            timeout: Duration::from_secs(30),
            retry_failed_tasks: false,
            max_retries: 2,
            retry_delay: Duration::from_millis(100),
            enable_dependency_resolution: true,
        }
    }
}

impl ParallelConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the in-flight task cap.
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set the per-task deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable retries with the given budget and delay.
    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.retry_failed_tasks = true;
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    /// Enable or disable dependency resolution.
    pub fn with_dependency_resolution(mut self, enabled: bool) -> Self {
        self.enable_dependency_resolution = enabled;
        self
    }
}

/// Cumulative executor statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutorStats {
    /// Tasks that finished processing, success or failure.
    pub completed_tasks: u64,
    /// Tasks that produced a result.
    pub successful_tasks: u64,
    /// Tasks that failed.
    pub failed_tasks: u64,
    /// Mean processing time over executed tasks.
    pub average_execution_time: Duration,
}

/// Runs query tasks concurrently through a shared runner.
pub struct ParallelQueryExecutor {
    runner: Arc<QueryRunner>,
    config: ParallelConfig,
    statuses: DashMap<String, TaskStatus>,
    completed: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    execution_us: AtomicU64,
    executed: AtomicU64,
    events: EventListeners<TaskEvent>,
}

impl ParallelQueryExecutor {
    /// Create an executor over a runner.
    pub fn new(runner: Arc<QueryRunner>, config: ParallelConfig) -> Self {
        Self {
            runner,
            config,
            statuses: DashMap::new(),
            completed: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            execution_us: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            events: EventListeners::new(),
        }
    }

    /// Task lifecycle event listeners.
    pub fn events(&self) -> &EventListeners<TaskEvent> {
        &self.events
    }

    /// Execute one task, retrying per configuration.
    ///
    /// Emits `TaskEvent::Completed` or `TaskEvent::Failed` and records
    /// the outcome in the status registry.
    pub async fn execute_task(&self, task: &QueryTask) -> ParallelQueryResult {
        let started_at = Instant::now();
        let mut options = task.options.clone();
        if options.timeout.is_none() {
            options.timeout = Some(self.config.timeout);
        }

        let mut attempts = 0u32;
        let outcome = loop {
            attempts += 1;
            match self
                .runner
                .execute(&task.query, task.params.as_ref(), &options)
                .await
            {
                Ok(result) => break Ok(result),
                Err(error)
                    if self.config.retry_failed_tasks
                        && attempts <= self.config.max_retries
                        && error.is_retryable() =>
                {
                    tracing::warn!(
                        task_id = %task.id,
                        attempt = attempts,
                        error = %error,
                        "task attempt failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(error) => break Err(error),
            }
        };

        let finished_at = Instant::now();
        let execution_time = finished_at.duration_since(started_at);
        self.record_processed(execution_time);

        match outcome {
            Ok(result) => {
                self.successful.fetch_add(1, Ordering::Relaxed);
                self.statuses.insert(task.id.clone(), TaskStatus::Completed);
                self.events.emit(&TaskEvent::Completed {
                    task_id: task.id.clone(),
                    duration: execution_time,
                });
                ParallelQueryResult {
                    task_id: task.id.clone(),
                    result: Some(result),
                    error: None,
                    started_at,
                    finished_at,
                    execution_time,
                }
            }
            Err(error) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.statuses.insert(task.id.clone(), TaskStatus::Failed);
                self.events.emit(&TaskEvent::Failed {
                    task_id: task.id.clone(),
                    error: error.to_string(),
                    attempts,
                });
                ParallelQueryResult {
                    task_id: task.id.clone(),
                    result: None,
                    error: Some(error.to_string()),
                    started_at,
                    finished_at,
                    execution_time,
                }
            }
        }
    }

    /// Execute a batch of tasks, returning one result per task in input
    /// order.
    ///
    /// With dependency resolution on, cycles and missing dependency ids
    /// resolve as structural failures before anything is dispatched, and
    /// a task starts only after all of its dependencies completed
    /// successfully; a failed dependency fails its dependents without
    /// execution. At most `max_concurrency` tasks are in flight; ready
    /// tasks start in descending priority order.
    pub async fn execute_parallel(&self, tasks: Vec<QueryTask>) -> Vec<ParallelQueryResult> {
        if tasks.is_empty() {
            return Vec::new();
        }

        if !self.config.enable_dependency_resolution {
            return self.execute_unordered(tasks).await;
        }

        let n = tasks.len();
        let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        let priorities: Vec<i32> = tasks.iter().map(|t| t.priority).collect();
        let mut slots: Vec<Option<ParallelQueryResult>> = (0..n).map(|_| None).collect();
        let mut done = vec![false; n];
        let mut failed = vec![false; n];
        let mut scheduled = vec![false; n];

        // First occurrence wins; duplicates are structural defects.
        let mut id_to_idx: HashMap<&str, usize> = HashMap::new();
        for (i, id) in ids.iter().enumerate() {
            if id_to_idx.contains_key(id.as_str()) {
                let error = Error::Structural(format!("duplicate task id '{id}'"));
                self.mark_structural(&mut slots, &mut done, &mut failed, i, id, &error);
            } else {
                id_to_idx.insert(id.as_str(), i);
            }
        }

        // Resolve dependency ids to indices; unknown ids are structural.
        let mut dep_idxs: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, task) in tasks.iter().enumerate() {
            if done[i] {
                continue;
            }
            for dep in &task.dependencies {
                match id_to_idx.get(dep.as_str()) {
                    Some(&d) if d != i => dep_idxs[i].push(d),
                    Some(_) => {
                        let error =
                            Error::Structural(format!("task '{}' depends on itself", task.id));
                        self.mark_structural(&mut slots, &mut done, &mut failed, i, &ids[i], &error);
                        break;
                    }
                    None => {
                        let error = Error::Structural(format!(
                            "task '{}' has missing dependency '{}'",
                            task.id, dep
                        ));
                        self.mark_structural(&mut slots, &mut done, &mut failed, i, &ids[i], &error);
                        break;
                    }
                }
            }
        }

        // Kahn's algorithm over the remaining tasks; whatever cannot be
        // ordered sits on a cycle.
        for i in self.detect_cycles(&tasks, &dep_idxs, &done) {
            let error = Error::Structural(format!(
                "task '{}' is part of a circular dependency",
                ids[i]
            ));
            self.mark_structural(&mut slots, &mut done, &mut failed, i, &ids[i], &error);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut owned: Vec<Option<QueryTask>> = tasks.into_iter().map(Some).collect();
        let mut in_flight = FuturesUnordered::new();

        loop {
            // Fail dependents of failed tasks without executing them.
            let mut progressed = true;
            while progressed {
                progressed = false;
                for i in 0..n {
                    if done[i] || scheduled[i] {
                        continue;
                    }
                    if let Some(&d) = dep_idxs[i].iter().find(|&&d| done[d] && failed[d]) {
                        let error = Error::Structural(format!(
                            "task '{}' skipped: dependency '{}' failed",
                            ids[i], ids[d]
                        ));
                        self.mark_structural(&mut slots, &mut done, &mut failed, i, &ids[i], &error);
                        progressed = true;
                    }
                }
            }

            // Collect ready tasks, highest priority first.
            let mut ready: Vec<usize> = (0..n)
                .filter(|&i| {
                    !done[i]
                        && !scheduled[i]
                        && dep_idxs[i].iter().all(|&d| done[d] && !failed[d])
                })
                .collect();
            ready.sort_by_key(|&i| (Reverse(priorities[i]), i));

            // Acquire the permit before dispatch so admission order is
            // exactly the priority order; tasks that miss out stay ready
            // for the next round.
            for i in ready {
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    break;
                };
                let Some(task) = owned[i].take() else {
                    continue;
                };
                scheduled[i] = true;
                in_flight.push(async move {
                    let _permit = permit;
                    (i, self.execute_task(&task).await)
                });
            }

            if in_flight.is_empty() {
                break;
            }
            if let Some((i, result)) = in_flight.next().await {
                failed[i] = !result.is_success();
                done[i] = true;
                slots[i] = Some(result);
            }
        }

        slots.into_iter().flatten().collect()
    }

    /// Resolution state of a task id from any prior batch.
    pub fn task_status(&self, id: &str) -> TaskStatus {
        self.statuses
            .get(id)
            .map(|s| *s)
            .unwrap_or(TaskStatus::NotFound)
    }

    /// Snapshot the cumulative counters.
    pub fn stats(&self) -> ExecutorStats {
        let executed = self.executed.load(Ordering::Relaxed);
        ExecutorStats {
            completed_tasks: self.completed.load(Ordering::Relaxed),
            successful_tasks: self.successful.load(Ordering::Relaxed),
            failed_tasks: self.failed.load(Ordering::Relaxed),
            average_execution_time: if executed > 0 {
                Duration::from_micros(self.execution_us.load(Ordering::Relaxed) / executed)
            } else {
                Duration::ZERO
            },
        }
    }

    /// Run every task under the concurrency cap, priority first, with no
    /// ordering constraints.
    async fn execute_unordered(&self, tasks: Vec<QueryTask>) -> Vec<ParallelQueryResult> {
        let n = tasks.len();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));

        let mut indexed: Vec<(usize, QueryTask)> = tasks.into_iter().enumerate().collect();
        indexed.sort_by_key(|(i, task)| (Reverse(task.priority), *i));

        let futures = indexed.into_iter().map(|(i, task)| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (i, self.execute_task(&task).await)
            }
        });

        let mut slots: Vec<Option<ParallelQueryResult>> = (0..n).map(|_| None).collect();
        for (i, result) in join_all(futures).await {
            slots[i] = Some(result);
        }
        slots.into_iter().flatten().collect()
    }

    fn detect_cycles(
        &self,
        tasks: &[QueryTask],
        dep_idxs: &[Vec<usize>],
        done: &[bool],
    ) -> Vec<usize> {
        let n = tasks.len();
        let mut indegree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

        for i in 0..n {
            if done[i] {
                continue;
            }
            for &d in &dep_idxs[i] {
                // Structurally failed dependencies resolve at scheduling
                // time; only live edges count for cycle detection.
                if !done[d] {
                    indegree[i] += 1;
                    dependents[d].push(i);
                }
            }
        }

        let mut queue: Vec<usize> = (0..n).filter(|&i| !done[i] && indegree[i] == 0).collect();
        let mut ordered = 0usize;
        while let Some(i) = queue.pop() {
            ordered += 1;
            for &dep in &dependents[i] {
                indegree[dep] -= 1;
                if indegree[dep] == 0 {
                    queue.push(dep);
                }
            }
        }

        let live = (0..n).filter(|&i| !done[i]).count();
        if ordered == live {
            return Vec::new();
        }
        (0..n)
            .filter(|&i| !done[i] && indegree[i] > 0)
            .collect()
    }

    fn mark_structural(
        &self,
        slots: &mut [Option<ParallelQueryResult>],
        done: &mut [bool],
        failed: &mut [bool],
        idx: usize,
        task_id: &str,
        error: &Error,
    ) {
        tracing::error!(task_id = %task_id, error = %error, "task resolved without execution");
        slots[idx] = Some(ParallelQueryResult::structural(task_id.to_string(), error));
        done[idx] = true;
        failed[idx] = true;
        self.statuses.insert(task_id.to_string(), TaskStatus::Failed);
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_processed(&self, execution_time: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.executed.fetch_add(1, Ordering::Relaxed);
        self.execution_us
            .fetch_add(execution_time.as_micros() as u64, Ordering::Relaxed);
    }
}
