//! Session provider boundary.
//!
//! The execution core never talks to the transport directly; it leases a
//! session from a provider for exactly one query and returns it on every
//! exit path. The concrete transport (and its pool) lives behind these
//! traits.

use async_trait::async_trait;

use graphlink_proto::{Params, RawResult};

use crate::error::Error;

/// A leased, space-scoped handle capable of executing raw queries.
#[async_trait]
pub trait Session: Send + Sync {
    /// Execute one raw query with optional parameters.
    async fn execute(&self, query: &str, params: Option<&Params>) -> Result<RawResult, Error>;

    /// Re-scope the session to another space.
    async fn switch_space(&mut self, space: &str) -> Result<(), Error>;

    /// Close the underlying handle.
    async fn close(&mut self);
}

/// Hands out pooled sessions, optionally scoped to a named space.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Lease a session, scoped to `space` when given.
    async fn get_session(&self, space: Option<&str>) -> Result<Box<dyn Session>, Error>;

    /// Return a leased session to the pool.
    async fn release_session(&self, session: Box<dyn Session>);
}
