//! Boundary traits for the shared connection and the backend lock strategy
//!
//! The engine never talks to a backend directly. A [`SharedConnection`] is the
//! stateful session it opens and closes, and a [`SyncStrategy`] knows how to
//! take and give back a named lock over that session.

use super::types::Timeout;
use crate::error::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// A lazily opened, stateful connection shared by every lock on one engine
#[async_trait]
pub trait SharedConnection: Send + Sync + 'static {
    /// Whether the connection is open and able to run lock commands
    fn is_query_ready(&self) -> bool;

    /// Open the connection
    async fn open(&mut self, cancel: &CancellationToken) -> Result<()>;

    /// Close the connection; it may be opened again later
    async fn close(&mut self) -> Result<()>;

    /// Release the connection for good
    async fn dispose(&mut self) -> Result<()>;
}

/// Backend-specific acquire/release of a named lock over a connection
///
/// The cookie proves ownership of a lock to the strategy that issued it. The
/// engine stores it and hands it back on release without inspecting it.
#[async_trait]
pub trait SyncStrategy<C: SharedConnection>: Send + Sync + 'static {
    /// Opaque ownership token
    type Cookie: Send + Sync + 'static;

    /// Try to take `name`, waiting at most `timeout`
    ///
    /// Returns `Ok(None)` when the lock is held elsewhere.
    async fn try_acquire(
        &self,
        connection: &mut C,
        name: &str,
        timeout: Timeout,
        cancel: &CancellationToken,
    ) -> Result<Option<Self::Cookie>>;

    /// Give back `name`
    async fn release(&self, connection: &mut C, name: &str, cookie: Self::Cookie) -> Result<()>;
}
