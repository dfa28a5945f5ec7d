//! Handles for locks held on a multiplexed engine
//!
//! A handle releases its lock exactly once. The owned state sits behind a
//! take-once slot, so whichever disposal call empties the slot performs the
//! release and every other call finds it empty and returns immediately.

use super::engine::EngineShared;
use super::strategy::{SharedConnection, SyncStrategy};
use crate::error::{Error, Result};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::{Builder, Handle, RuntimeFlavor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Everything needed to release one lock
struct HeldState<C, S: SyncStrategy<C>>
where
    C: SharedConnection,
{
    engine: Arc<EngineShared<C>>,
    strategy: Arc<S>,
    name: String,
    cookie: S::Cookie,
}

impl<C, S> HeldState<C, S>
where
    C: SharedConnection,
    S: SyncStrategy<C>,
{
    /// Run the engine release on its own task
    ///
    /// The task keeps running if the awaiting future is dropped, so a started
    /// release always completes.
    async fn release(self) -> Result<()> {
        let HeldState {
            engine,
            strategy,
            name,
            cookie,
        } = self;

        tokio::spawn(async move { engine.release(&name, cookie, strategy.as_ref()).await })
            .await
            .map_err(|e| Error::Runtime(format!("lock release task failed: {}", e)))?
    }
}

/// A lock acquired through [`super::MultiplexedLockEngine::try_acquire`]
///
/// Dispose it with [`LockHandle::dispose`] or, outside async code,
/// [`LockHandle::dispose_blocking`]. Both are idempotent and safe to call
/// concurrently.
pub struct LockHandle<C, S>
where
    C: SharedConnection,
    S: SyncStrategy<C>,
{
    name: String,
    state: Mutex<Option<HeldState<C, S>>>,
    lost: CancellationToken,
}

impl<C, S> LockHandle<C, S>
where
    C: SharedConnection,
    S: SyncStrategy<C>,
{
    pub(crate) fn new(
        engine: Arc<EngineShared<C>>,
        strategy: Arc<S>,
        name: String,
        cookie: S::Cookie,
    ) -> Self {
        Self {
            name: name.clone(),
            state: Mutex::new(Some(HeldState {
                engine,
                strategy,
                name,
                cookie,
            })),
            lost: CancellationToken::new(),
        }
    }

    /// Get the lock name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the handle has been disposed
    pub fn is_disposed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Token signalled if the lock is lost while held
    ///
    /// The engine does not monitor its connection, so this token is never
    /// cancelled.
    pub fn handle_lost_token(&self) -> CancellationToken {
        self.lost.clone()
    }

    /// Release the lock
    ///
    /// The first call releases; later and concurrent calls return `Ok(())`
    /// without touching the backend. A strategy failure is returned after the
    /// engine has already forgotten the lock.
    pub async fn dispose(&self) -> Result<()> {
        match self.take() {
            Some(held) => held.release().await,
            None => {
                debug!(lock_name = %self.name, "Lock handle already disposed");
                Ok(())
            }
        }
    }

    /// Release the lock from synchronous code, blocking until done
    ///
    /// Works from plain threads and from inside a multi-threaded tokio
    /// runtime. Fails on a current-thread runtime, which cannot be blocked.
    /// Never call this while holding the engine mutex: the release waits for
    /// that mutex and would deadlock.
    pub fn dispose_blocking(&self) -> Result<()> {
        match Handle::try_current() {
            Ok(handle) => {
                if handle.runtime_flavor() == RuntimeFlavor::CurrentThread {
                    return Err(Error::Runtime(
                        "cannot block on lock release inside a current-thread runtime".to_string(),
                    ));
                }
                tokio::task::block_in_place(|| handle.block_on(self.dispose()))
            }
            Err(_) => Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| Error::Runtime(format!("failed to build release runtime: {}", e)))?
                .block_on(self.dispose()),
        }
    }

    /// Empty the slot, returning its contents to exactly one caller
    fn take(&self) -> Option<HeldState<C, S>> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl<C, S> Drop for LockHandle<C, S>
where
    C: SharedConnection,
    S: SyncStrategy<C>,
{
    fn drop(&mut self) {
        let Some(held) = self.take() else {
            return;
        };

        match Handle::try_current() {
            Ok(handle) => {
                warn!(lock_name = %self.name, "Lock handle dropped without dispose, releasing in background");
                let name = self.name.clone();
                handle.spawn(async move {
                    if let Err(e) = held.release().await {
                        warn!(lock_name = %name, error = %e, "Background lock release failed");
                    }
                });
            }
            Err(_) => {
                warn!(lock_name = %self.name, "Lock handle dropped outside a runtime, releasing on a private runtime");
                let released = Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| Error::Runtime(format!("failed to build release runtime: {}", e)))
                    .and_then(|runtime| runtime.block_on(held.release()));
                if let Err(e) = released {
                    warn!(lock_name = %self.name, error = %e, "Lock release on drop failed");
                }
            }
        }
    }
}

impl<C, S> fmt::Debug for LockHandle<C, S>
where
    C: SharedConnection,
    S: SyncStrategy<C>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("name", &self.name)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl<C, S> fmt::Display for LockHandle<C, S>
where
    C: SharedConnection,
    S: SyncStrategy<C>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lock[{}]", self.name)
    }
}
