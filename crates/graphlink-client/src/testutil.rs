//! Shared mock session provider for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use graphlink_proto::{Params, RawResult, Record};

use crate::error::Error;
use crate::session::{Session, SessionProvider};

pub(crate) struct MockState {
    calls: Mutex<Vec<String>>,
    fail_first: usize,
    executed: AtomicUsize,
    delay: Option<Duration>,
}

/// Provider whose sessions answer every query with one row echoing the
/// query text. The first `fail_first` execute calls fail with a
/// transient execution error.
pub(crate) struct MockProvider {
    state: Arc<MockState>,
}

impl MockProvider {
    pub(crate) fn new() -> Arc<Self> {
        Self::build(0, None)
    }

    pub(crate) fn failing_first(fail_first: usize) -> Arc<Self> {
        Self::build(fail_first, None)
    }

    pub(crate) fn with_delay(delay: Duration) -> Arc<Self> {
        Self::build(0, Some(delay))
    }

    fn build(fail_first: usize, delay: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(MockState {
                calls: Mutex::new(Vec::new()),
                fail_first,
                executed: AtomicUsize::new(0),
                delay,
            }),
        })
    }

    /// Queries executed, in dispatch order.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.calls.lock().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.state.calls.lock().len()
    }
}

struct MockSession {
    state: Arc<MockState>,
}

#[async_trait]
impl Session for MockSession {
    async fn execute(&self, query: &str, _params: Option<&Params>) -> Result<RawResult, Error> {
        self.state.calls.lock().push(query.to_string());
        if let Some(delay) = self.state.delay {
            tokio::time::sleep(delay).await;
        }
        let call = self.state.executed.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.state.fail_first {
            return Err(Error::Execution("connection reset".into()));
        }
        let mut record = Record::new();
        record.insert("query".into(), json!(query));
        Ok(RawResult::with_data(vec![record]).columns(vec!["query".into()]))
    }

    async fn switch_space(&mut self, _space: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl SessionProvider for MockProvider {
    async fn get_session(&self, _space: Option<&str>) -> Result<Box<dyn Session>, Error> {
        Ok(Box::new(MockSession {
            state: Arc::clone(&self.state),
        }))
    }

    async fn release_session(&self, _session: Box<dyn Session>) {}
}
