//! In-process lock backend
//!
//! [`MemoryLockStore`] plays the part of the external arbiter: a table of
//! lock names owned by connection sessions. [`MemoryConnection`] opens a new
//! session on every `open` and drops all of that session's locks on `close`,
//! the way a database session gives up its advisory locks when it ends.
//! [`MemoryStrategy`] takes and returns names in the store.
//!
//! Both the connection and the strategy expose shared counters and failure
//! switches so callers can observe and steer the engine from the outside.

use crate::error::{Error, Result};
use crate::locking::{SharedConnection, SyncStrategy, Timeout};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Ownership proof issued by [`MemoryStrategy`]
#[derive(Debug, PartialEq, Eq)]
pub struct MemoryCookie(Uuid);

impl MemoryCookie {
    /// Get the cookie id
    pub fn id(&self) -> Uuid {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
struct Owner {
    session: Uuid,
    cookie: Uuid,
}

#[derive(Debug, Default)]
struct StoreInner {
    owners: Mutex<HashMap<String, Owner>>,
    released: Notify,
}

/// Shared table of lock owners
#[derive(Debug, Clone, Default)]
pub struct MemoryLockStore {
    inner: Arc<StoreInner>,
}

impl MemoryLockStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new, unopened connection to this store
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection {
            store: self.clone(),
            session: None,
            stats: ConnectionStats::default(),
        }
    }

    /// Check if any session holds `name`
    pub fn is_locked(&self, name: &str) -> bool {
        self.owners().contains_key(name)
    }

    /// Number of locks held across all sessions
    pub fn lock_count(&self) -> usize {
        self.owners().len()
    }

    fn owners(&self) -> std::sync::MutexGuard<'_, HashMap<String, Owner>> {
        self.inner
            .owners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn try_take(&self, name: &str, session: Uuid) -> Option<MemoryCookie> {
        let mut owners = self.owners();
        if owners.contains_key(name) {
            return None;
        }
        let cookie = Uuid::new_v4();
        owners.insert(name.to_string(), Owner { session, cookie });
        Some(MemoryCookie(cookie))
    }

    /// Take `name` for `session`, waiting up to `timeout` for it to be freed
    async fn take(
        &self,
        name: &str,
        session: Uuid,
        timeout: Timeout,
        cancel: &CancellationToken,
    ) -> Result<Option<MemoryCookie>> {
        let deadline = timeout.as_duration().map(|d| Instant::now() + d);

        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(cookie) = self.try_take(name, session) {
                return Ok(Some(cookie));
            }
            if timeout.is_zero() {
                return Ok(None);
            }

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled(name.to_string())),
                        _ = tokio::time::sleep_until(deadline) => return Ok(None),
                        _ = &mut notified => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled(name.to_string())),
                        _ = &mut notified => {}
                    }
                }
            }
        }
    }

    fn give_back(&self, name: &str, cookie: &MemoryCookie) -> Result<()> {
        let mut owners = self.owners();
        match owners.get(name) {
            Some(owner) if owner.cookie == cookie.0 => {
                owners.remove(name);
                drop(owners);
                self.inner.released.notify_waiters();
                Ok(())
            }
            _ => Err(Error::strategy(name, "cookie does not own the lock")),
        }
    }

    fn end_session(&self, session: Uuid) -> usize {
        let mut owners = self.owners();
        let before = owners.len();
        owners.retain(|_, owner| owner.session != session);
        let dropped = before - owners.len();
        drop(owners);
        if dropped > 0 {
            self.inner.released.notify_waiters();
        }
        dropped
    }
}

#[derive(Debug, Default)]
struct ConnectionCounters {
    opens: AtomicUsize,
    closes: AtomicUsize,
    open: AtomicBool,
    disposed: AtomicBool,
    fail_next_open: AtomicBool,
}

/// Observer for a [`MemoryConnection`] that stays valid after the connection
/// moves into an engine
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    counters: Arc<ConnectionCounters>,
}

impl ConnectionStats {
    /// Number of successful opens
    pub fn opens(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    /// Number of closes
    pub fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    /// Check if the connection is currently open
    pub fn is_open(&self) -> bool {
        self.counters.open.load(Ordering::SeqCst)
    }

    /// Check if the connection has been disposed
    pub fn is_disposed(&self) -> bool {
        self.counters.disposed.load(Ordering::SeqCst)
    }

    /// Make the next `open` fail with a connection error
    pub fn fail_next_open(&self) {
        self.counters.fail_next_open.store(true, Ordering::SeqCst);
    }
}

/// Connection to a [`MemoryLockStore`]
#[derive(Debug)]
pub struct MemoryConnection {
    store: MemoryLockStore,
    session: Option<Uuid>,
    stats: ConnectionStats,
}

impl MemoryConnection {
    /// Get a stats observer for this connection
    pub fn stats(&self) -> ConnectionStats {
        self.stats.clone()
    }

    /// Get the current session id, if open
    pub fn session(&self) -> Option<Uuid> {
        self.session
    }
}

#[async_trait]
impl SharedConnection for MemoryConnection {
    fn is_query_ready(&self) -> bool {
        self.session.is_some()
    }

    async fn open(&mut self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled("connection open".to_string()));
        }
        if self.stats.counters.disposed.load(Ordering::SeqCst) {
            return Err(Error::Connection("connection is disposed".to_string()));
        }
        if self.stats.counters.fail_next_open.swap(false, Ordering::SeqCst) {
            return Err(Error::Connection("simulated open failure".to_string()));
        }

        let session = Uuid::new_v4();
        debug!(session = %session, "Memory session opened");
        self.session = Some(session);
        self.stats.counters.opens.fetch_add(1, Ordering::SeqCst);
        self.stats.counters.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            let dropped = self.store.end_session(session);
            debug!(session = %session, dropped, "Memory session closed");
            self.stats.counters.closes.fetch_add(1, Ordering::SeqCst);
            self.stats.counters.open.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn dispose(&mut self) -> Result<()> {
        self.close().await?;
        self.stats.counters.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StrategyCounters {
    acquire_calls: AtomicUsize,
    release_calls: AtomicUsize,
    fail_next_release: AtomicBool,
}

/// Observer for a [`MemoryStrategy`]
#[derive(Debug, Clone, Default)]
pub struct StrategyStats {
    counters: Arc<StrategyCounters>,
}

impl StrategyStats {
    /// Number of acquire attempts that reached the strategy
    pub fn acquire_calls(&self) -> usize {
        self.counters.acquire_calls.load(Ordering::SeqCst)
    }

    /// Number of release calls that reached the strategy
    pub fn release_calls(&self) -> usize {
        self.counters.release_calls.load(Ordering::SeqCst)
    }

    /// Make the next release fail without giving the lock back
    pub fn fail_next_release(&self) {
        self.counters.fail_next_release.store(true, Ordering::SeqCst);
    }
}

/// Exclusive lock strategy over [`MemoryConnection`]
#[derive(Debug, Default)]
pub struct MemoryStrategy {
    stats: StrategyStats,
}

impl MemoryStrategy {
    /// Create a strategy
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a stats observer for this strategy
    pub fn stats(&self) -> StrategyStats {
        self.stats.clone()
    }
}

#[async_trait]
impl SyncStrategy<MemoryConnection> for MemoryStrategy {
    type Cookie = MemoryCookie;

    async fn try_acquire(
        &self,
        connection: &mut MemoryConnection,
        name: &str,
        timeout: Timeout,
        cancel: &CancellationToken,
    ) -> Result<Option<MemoryCookie>> {
        self.stats
            .counters
            .acquire_calls
            .fetch_add(1, Ordering::SeqCst);

        let session = connection
            .session
            .ok_or_else(|| Error::Connection("connection is not open".to_string()))?;

        connection.store.take(name, session, timeout, cancel).await
    }

    async fn release(
        &self,
        connection: &mut MemoryConnection,
        name: &str,
        cookie: MemoryCookie,
    ) -> Result<()> {
        self.stats
            .counters
            .release_calls
            .fetch_add(1, Ordering::SeqCst);

        if self
            .stats
            .counters
            .fail_next_release
            .swap(false, Ordering::SeqCst)
        {
            return Err(Error::strategy(name, "simulated release failure"));
        }

        connection.store.give_back(name, &cookie)
    }
}
