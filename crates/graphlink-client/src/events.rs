//! Typed lifecycle events.
//!
//! Each event family has its own observer list instead of one untyped
//! bus. Emission is synchronous and infallible; a subscriber cannot fail
//! the operation that notified it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

/// Pipeline lifecycle events.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A pipeline invocation entered.
    Started {
        /// Query text of the invocation.
        query: String,
    },
    /// A pipeline invocation produced a result.
    Completed {
        /// Query text of the invocation.
        query: String,
        /// Wall-clock duration of the whole invocation.
        duration: Duration,
    },
    /// A pipeline invocation failed.
    Failed {
        /// Query text of the invocation.
        query: String,
        /// Rendered error.
        error: String,
        /// Wall-clock duration until the failure surfaced.
        duration: Duration,
    },
}

/// Parallel-task lifecycle events.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A task finished successfully.
    Completed {
        /// Task id within its batch.
        task_id: String,
        /// Wall-clock duration of the task.
        duration: Duration,
    },
    /// A task failed after exhausting its retries.
    Failed {
        /// Task id within its batch.
        task_id: String,
        /// Rendered error.
        error: String,
        /// Attempts made, including the first.
        attempts: u32,
    },
}

/// Observer list for one event type.
pub struct EventListeners<E> {
    listeners: RwLock<Vec<Arc<dyn Fn(&E) + Send + Sync>>>,
}

impl<E> EventListeners<E> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener.
    pub fn subscribe(&self, listener: impl Fn(&E) + Send + Sync + 'static) {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Notify every listener.
    pub fn emit(&self, event: &E) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(event);
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }
}

impl<E> Default for EventListeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_emit_reaches_all_listeners() {
        let listeners = EventListeners::<TaskEvent>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..2 {
            let seen = Arc::clone(&seen);
            listeners.subscribe(move |event: &TaskEvent| {
                if let TaskEvent::Completed { task_id, .. } = event {
                    seen.lock().push(task_id.clone());
                }
            });
        }

        listeners.emit(&TaskEvent::Completed {
            task_id: "t1".into(),
            duration: Duration::ZERO,
        });

        assert_eq!(seen.lock().as_slice(), ["t1", "t1"]);
    }

    #[test]
    fn test_emit_without_listeners_is_noop() {
        let listeners = EventListeners::<PipelineEvent>::new();
        assert!(listeners.is_empty());
        listeners.emit(&PipelineEvent::Started {
            query: "SHOW SPACES".into(),
        });
    }
}
