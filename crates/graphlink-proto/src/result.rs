//! Result types for query responses.
//!
//! A session returns a [`RawResult`] straight off the wire; the execution
//! core formats it into a [`QueryResult`] with defaults filled in.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single row of a query result, keyed by column name.
pub type Record = serde_json::Map<String, Value>;

/// Query parameters, keyed by placeholder name.
///
/// Ordered so that canonical serialization (and therefore cache keying)
/// is deterministic regardless of insertion order.
pub type Params = BTreeMap<String, Value>;

/// Raw response from a session execute call, before formatting.
///
/// Every field is optional: the transport may omit data for DDL
/// statements, omit latency for older servers, and so on. The execution
/// core defaults absent fields when building a [`QueryResult`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawResult {
    /// Result rows, if the statement produced any.
    pub data: Option<Vec<Record>>,
    /// Column names, parallel with each record's keys.
    pub columns: Option<Vec<String>>,
    /// Server-reported error text, if the statement failed server-side.
    pub error: Option<String>,
    /// Server-side latency, if reported.
    pub latency: Option<Duration>,
    /// Space the statement ran against, if any.
    pub space: Option<String>,
}

impl RawResult {
    /// Create a raw result carrying rows.
    pub fn with_data(data: Vec<Record>) -> Self {
        Self {
            data: Some(data),
            ..Default::default()
        }
    }

    /// Create a raw result carrying a server-side error.
    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Set the column names.
    pub fn columns(mut self, columns: Vec<String>) -> Self {
        self.columns = Some(columns);
        self
    }

    /// Set the server-side latency.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Set the space name.
    pub fn space(mut self, space: impl Into<String>) -> Self {
        self.space = Some(space.into());
        self
    }
}

/// Metadata carried alongside a formatted result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    /// Column names of the result set.
    pub columns: Vec<String>,
    /// Server-side latency.
    pub latency: Duration,
    /// Space the query ran against, if any.
    pub space: Option<String>,
}

/// Formatted result of one query execution.
///
/// Produced once per execution attempt and immutable afterwards. A result
/// with `error` set is returned to the caller but never cached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Result rows; empty when the statement produced none.
    pub data: Vec<Record>,
    /// Error text when the execution failed.
    pub error: Option<String>,
    /// Wall-clock time the execution took, as observed by the client.
    pub execution_time: Duration,
    /// Transport-level metadata.
    pub metadata: ResultMetadata,
}

impl QueryResult {
    /// Create an empty, successful result.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a formatted result from a raw session response.
    ///
    /// Absent fields default to empty sequences; `execution_time` is the
    /// elapsed time measured by the caller, not the server latency.
    pub fn from_raw(raw: RawResult, execution_time: Duration) -> Self {
        Self {
            data: raw.data.unwrap_or_default(),
            error: raw.error,
            execution_time,
            metadata: ResultMetadata {
                columns: raw.columns.unwrap_or_default(),
                latency: raw.latency.unwrap_or_default(),
                space: raw.space,
            },
        }
    }

    /// Whether the execution succeeded.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Number of rows in the result.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the result carries no rows.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the value at a specific row and column.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        self.data.get(row).and_then(|r| r.get(column))
    }
}
