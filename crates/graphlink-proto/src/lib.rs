//! GraphLink Proto - Shared result and value types for the GraphLink SDK.
//!
//! This crate defines the data model that crosses the session boundary:
//! the raw response a session hands back and the formatted [`QueryResult`]
//! the execution core returns to callers.

pub mod result;

pub use result::{Params, QueryResult, RawResult, Record, ResultMetadata};
