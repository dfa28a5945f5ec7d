//! Connection-multiplexing lock engine
//!
//! One engine owns one [`SharedConnection`] and lets several named locks live
//! on it at once. Every acquire, release and open/close transition runs while
//! holding the engine's async mutex, and that mutex stays held across the
//! backend call itself, so at most one lock command is in flight on the
//! connection at any time.
//!
//! The connection is opened on the first acquisition and closed again as soon
//! as the engine holds no locks.

use super::handle::LockHandle;
use super::retry::{self, FailedAttempt};
use super::strategy::{SharedConnection, SyncStrategy};
use super::types::{AcquireOutcome, HeldLock, RetryDecision, Timeout};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// State guarded by the engine mutex
pub(crate) struct EngineState<C> {
    connection: C,

    /// Held lock names and when they were taken
    held: HashMap<String, DateTime<Utc>>,

    disposed: bool,
}

impl<C: SharedConnection> EngineState<C> {
    /// Close the connection once nothing is held on it
    async fn close_if_idle(&mut self, label: &str) -> Result<()> {
        if self.held.is_empty() && self.connection.is_query_ready() {
            debug!(engine = %label, "Closing idle connection");
            self.connection.close().await?;
        }
        Ok(())
    }
}

/// Engine internals shared with outstanding lock handles
pub(crate) struct EngineShared<C> {
    label: String,
    state: Arc<Mutex<EngineState<C>>>,
}

impl<C: SharedConnection> EngineShared<C> {
    /// Run one acquisition attempt while owning the engine mutex
    ///
    /// The connection is closed if idle on every exit path before the mutex
    /// is released.
    async fn acquire_locked<S: SyncStrategy<C>>(
        self: &Arc<Self>,
        mut state: OwnedMutexGuard<EngineState<C>>,
        name: &str,
        timeout: Timeout,
        strategy: &Arc<S>,
        cancel: &CancellationToken,
        opportunistic: bool,
    ) -> Result<AcquireOutcome<C, S>> {
        let label = self.label.as_str();

        let attempt = self
            .attempt(&mut state, name, timeout, strategy, cancel, opportunistic)
            .await;
        let cleanup = state.close_if_idle(label).await;
        drop(state);

        match (attempt, cleanup) {
            (Ok(outcome), Ok(())) => {
                match &outcome {
                    AcquireOutcome::Acquired(_) => {
                        debug!(engine = %label, lock_name = %name, "Lock acquired")
                    }
                    AcquireOutcome::Busy {
                        retry,
                        can_safely_dispose,
                    } => debug!(
                        engine = %label,
                        lock_name = %name,
                        retry = %retry,
                        can_safely_dispose = *can_safely_dispose,
                        "Lock busy"
                    ),
                }
                Ok(outcome)
            }
            (Ok(_), Err(close_err)) => Err(close_err),
            (Err(e), cleanup) => {
                if let Err(close_err) = cleanup {
                    warn!(engine = %label, error = %close_err, "Failed to close idle connection");
                }
                Err(e)
            }
        }
    }

    /// Acquisition body, without the idle close
    async fn attempt<S: SyncStrategy<C>>(
        self: &Arc<Self>,
        state: &mut EngineState<C>,
        name: &str,
        timeout: Timeout,
        strategy: &Arc<S>,
        cancel: &CancellationToken,
        opportunistic: bool,
    ) -> Result<AcquireOutcome<C, S>> {
        if state.disposed {
            return Err(Error::InvariantViolation(format!(
                "engine '{}' used after dispose",
                self.label
            )));
        }

        if state.held.contains_key(name) {
            return Ok(busy(state, &self.label, name, timeout, opportunistic, true));
        }

        if !state.connection.is_query_ready() {
            debug!(engine = %self.label, "Opening connection");
            state.connection.open(cancel).await?;
        }

        let effective_timeout = if opportunistic { Timeout::ZERO } else { timeout };

        match strategy
            .try_acquire(&mut state.connection, name, effective_timeout, cancel)
            .await?
        {
            Some(cookie) => {
                state.held.insert(name.to_string(), Utc::now());
                Ok(AcquireOutcome::Acquired(LockHandle::new(
                    Arc::clone(self),
                    Arc::clone(strategy),
                    name.to_string(),
                    cookie,
                )))
            }
            None => Ok(busy(state, &self.label, name, timeout, opportunistic, false)),
        }
    }

    /// Release `name` on behalf of a lock handle
    ///
    /// Waits for the mutex without cancellation. The held entry is removed and
    /// the connection closed if idle before a strategy failure is returned.
    pub(crate) async fn release<S: SyncStrategy<C>>(
        &self,
        name: &str,
        cookie: S::Cookie,
        strategy: &S,
    ) -> Result<()> {
        let mut state = self.state.lock().await;

        let released = strategy.release(&mut state.connection, name, cookie).await;

        let removed = state.held.remove(name);
        if removed.is_none() {
            error!(engine = %self.label, lock_name = %name, "Released a lock the engine did not hold");
        }
        debug_assert!(removed.is_some(), "lock '{}' missing from held set", name);

        let cleanup = state.close_if_idle(&self.label).await;
        drop(state);

        match released {
            Ok(()) => {
                debug!(engine = %self.label, lock_name = %name, "Lock released");
                cleanup
            }
            Err(e) => {
                warn!(engine = %self.label, lock_name = %name, error = %e, "Strategy release failed");
                if let Err(close_err) = cleanup {
                    warn!(engine = %self.label, error = %close_err, "Failed to close idle connection");
                }
                Err(e)
            }
        }
    }
}

/// A lock engine multiplexing named locks over one shared connection
///
/// Cloning is cheap and yields another reference to the same engine.
pub struct MultiplexedLockEngine<C: SharedConnection> {
    shared: Arc<EngineShared<C>>,
    config: EngineConfig,
}

impl<C: SharedConnection> MultiplexedLockEngine<C> {
    /// Create an engine over a fresh, unopened connection
    pub fn new(connection: C) -> Self {
        Self::with_config(connection, EngineConfig::default())
    }

    /// Create an engine with the given configuration
    pub fn with_config(connection: C, config: EngineConfig) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                label: config.label.clone(),
                state: Arc::new(Mutex::new(EngineState {
                    connection,
                    held: HashMap::new(),
                    disposed: false,
                })),
            }),
            config,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get the engine label used in log fields
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Default timeout from the configuration
    pub fn default_timeout(&self) -> Timeout {
        self.config.default_timeout()
    }

    /// Try to acquire the lock `name` on this engine's connection
    ///
    /// An opportunistic attempt never waits: it gives up at once if another
    /// operation holds the engine mutex, and asks the strategy for a
    /// zero-timeout attempt. A non-opportunistic attempt waits for the mutex
    /// until `cancel` fires and passes `timeout` to the strategy.
    ///
    /// Contention is reported as [`AcquireOutcome::Busy`]; errors are only
    /// returned for cancellation, connection or strategy failures, and use of
    /// a disposed engine.
    ///
    /// Once the mutex is taken, the attempt runs on its own task. Dropping the
    /// returned future cancels the backend call, and the task still closes an
    /// idle connection before giving up the mutex.
    pub async fn try_acquire<S: SyncStrategy<C>>(
        &self,
        name: &str,
        timeout: Timeout,
        strategy: &Arc<S>,
        cancel: &CancellationToken,
        opportunistic: bool,
    ) -> Result<AcquireOutcome<C, S>> {
        let label = self.shared.label.as_str();

        debug!(
            engine = %label,
            lock_name = %name,
            timeout = %timeout,
            opportunistic,
            "Attempting to acquire lock"
        );

        let state = if opportunistic {
            match Arc::clone(&self.shared.state).try_lock_owned() {
                Ok(state) => state,
                Err(_) => {
                    debug!(engine = %label, lock_name = %name, "Engine busy, skipping opportunistic attempt");
                    return Ok(AcquireOutcome::Busy {
                        retry: RetryDecision::RetryOnOtherEngine,
                        can_safely_dispose: false,
                    });
                }
            }
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(engine = %label, lock_name = %name, "Cancelled while waiting for engine");
                    return Err(Error::Cancelled(name.to_string()));
                }
                state = Arc::clone(&self.shared.state).lock_owned() => state,
            }
        };

        let attempt_cancel = cancel.child_token();
        let _cancel_on_drop = attempt_cancel.clone().drop_guard();

        let shared = Arc::clone(&self.shared);
        let strategy = Arc::clone(strategy);
        let name = name.to_string();

        tokio::spawn(async move {
            shared
                .acquire_locked(state, &name, timeout, &strategy, &attempt_cancel, opportunistic)
                .await
        })
        .await
        .map_err(|e| Error::Runtime(format!("lock acquisition task failed: {}", e)))?
    }

    /// Check whether the engine is busy or holds any lock
    ///
    /// Never waits: a contended mutex counts as in use.
    pub fn is_in_use(&self) -> bool {
        match self.shared.state.try_lock() {
            Ok(state) => !state.held.is_empty(),
            Err(_) => true,
        }
    }

    /// List the locks currently held on this engine, sorted by name
    pub async fn held_locks(&self) -> Vec<HeldLock> {
        let state = self.shared.state.lock().await;
        let mut held: Vec<HeldLock> = state
            .held
            .iter()
            .map(|(name, acquired_at)| HeldLock {
                name: name.clone(),
                acquired_at: *acquired_at,
            })
            .collect();
        held.sort_by(|a, b| a.name.cmp(&b.name));
        held
    }

    /// Dispose the engine and its connection
    ///
    /// Every handle must have been disposed first; otherwise this fails with
    /// [`Error::InvariantViolation`] and the connection is left as is.
    /// Disposing twice is a no-op.
    pub async fn dispose(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;

        if !state.held.is_empty() {
            let mut names: Vec<&str> = state.held.keys().map(String::as_str).collect();
            names.sort_unstable();
            let names = names.join(", ");
            error!(engine = %self.shared.label, held = %names, "Engine disposed while holding locks");
            return Err(Error::InvariantViolation(format!(
                "engine '{}' disposed while holding: {}",
                self.shared.label, names
            )));
        }

        if state.disposed {
            return Ok(());
        }
        state.disposed = true;

        debug!(engine = %self.shared.label, "Disposing connection");
        state.connection.dispose().await
    }
}

/// Build the busy outcome for a failed attempt
fn busy<C, S>(
    state: &EngineState<C>,
    label: &str,
    name: &str,
    timeout: Timeout,
    opportunistic: bool,
    is_already_held: bool,
) -> AcquireOutcome<C, S>
where
    C: SharedConnection,
    S: SyncStrategy<C>,
{
    if is_already_held {
        debug!(engine = %label, lock_name = %name, opportunistic, "Lock already held on this engine");
    }

    let (retry, can_safely_dispose) = retry::decide(FailedAttempt {
        opportunistic,
        is_already_held,
        timeout_is_zero: timeout.is_zero(),
        holding_others: !state.held.is_empty(),
    });

    AcquireOutcome::Busy {
        retry,
        can_safely_dispose,
    }
}

impl<C: SharedConnection> Clone for MultiplexedLockEngine<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            config: self.config.clone(),
        }
    }
}

impl<C: SharedConnection> fmt::Debug for MultiplexedLockEngine<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiplexedLockEngine")
            .field("label", &self.shared.label)
            .field("in_use", &self.is_in_use())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryLockStore, MemoryStrategy};
    use std::time::Duration;

    fn engine(store: &MemoryLockStore) -> MultiplexedLockEngine<crate::memory::MemoryConnection> {
        MultiplexedLockEngine::new(store.connect())
    }

    fn five_seconds() -> Timeout {
        Timeout::from(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_acquire_opens_connection() {
        let store = MemoryLockStore::new();
        let connection = store.connect();
        let stats = connection.stats();
        let engine = MultiplexedLockEngine::new(connection);
        let strategy = Arc::new(MemoryStrategy::new());
        let cancel = CancellationToken::new();

        assert!(!stats.is_open());

        let outcome = engine
            .try_acquire("A", five_seconds(), &strategy, &cancel, false)
            .await
            .expect("acquire failed");

        assert!(outcome.is_acquired());
        assert!(stats.is_open());
        assert!(engine.is_in_use());
        assert!(store.is_locked("A"));

        let names: Vec<String> = engine.held_locks().await.into_iter().map(|l| l.name).collect();
        assert_eq!(names, vec!["A".to_string()]);

        outcome.into_handle().unwrap().dispose().await.unwrap();
        assert!(!stats.is_open());
        assert!(!engine.is_in_use());
    }

    #[tokio::test]
    async fn test_same_name_twice_is_busy() {
        let store = MemoryLockStore::new();
        let engine = engine(&store);
        let strategy = Arc::new(MemoryStrategy::new());
        let cancel = CancellationToken::new();

        let handle = engine
            .try_acquire("A", five_seconds(), &strategy, &cancel, false)
            .await
            .unwrap()
            .into_handle()
            .unwrap();

        let again = engine
            .try_acquire("A", five_seconds(), &strategy, &cancel, false)
            .await
            .unwrap();
        assert_eq!(again.retry(), Some(RetryDecision::NoRetry));
        assert!(!again.can_safely_dispose());

        let probe = engine
            .try_acquire("A", five_seconds(), &strategy, &cancel, true)
            .await
            .unwrap();
        assert_eq!(probe.retry(), Some(RetryDecision::RetryOnOtherEngine));
        assert!(!probe.can_safely_dispose());

        // The strategy was only consulted for the first attempt
        assert_eq!(strategy.stats().acquire_calls(), 1);

        handle.dispose().await.unwrap();
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_already_held_event_carries_engine_label() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let store = MemoryLockStore::new();
        let engine = MultiplexedLockEngine::with_config(
            store.connect(),
            EngineConfig::default().with_label("billing"),
        );
        let strategy = Arc::new(MemoryStrategy::new());
        let cancel = CancellationToken::new();

        let handle = engine
            .try_acquire("A", five_seconds(), &strategy, &cancel, false)
            .await
            .unwrap()
            .into_handle()
            .unwrap();
        let again = engine
            .try_acquire("A", five_seconds(), &strategy, &cancel, true)
            .await
            .unwrap();
        assert!(!again.is_acquired());
        handle.dispose().await.unwrap();

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let line = output
            .lines()
            .find(|line| line.contains("Lock already held on this engine"))
            .expect("already-held event not logged");
        assert!(line.contains("engine=billing"), "{}", line);
        assert!(line.contains("lock_name=A"), "{}", line);
    }

    #[tokio::test]
    async fn test_failed_attempt_closes_idle_connection() {
        let store = MemoryLockStore::new();
        let other = engine(&store);
        let strategy = Arc::new(MemoryStrategy::new());
        let cancel = CancellationToken::new();

        let held = other
            .try_acquire("B", Timeout::ZERO, &strategy, &cancel, false)
            .await
            .unwrap()
            .into_handle()
            .unwrap();

        let connection = store.connect();
        let stats = connection.stats();
        let engine = MultiplexedLockEngine::new(connection);

        let outcome = engine
            .try_acquire("B", Timeout::ZERO, &strategy, &cancel, false)
            .await
            .unwrap();

        assert_eq!(outcome.retry(), Some(RetryDecision::NoRetry));
        assert!(outcome.can_safely_dispose());
        assert_eq!(stats.opens(), 1);
        assert_eq!(stats.closes(), 1);
        assert!(!stats.is_open());

        held.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_failure_propagates() {
        let store = MemoryLockStore::new();
        let connection = store.connect();
        let stats = connection.stats();
        stats.fail_next_open();
        let engine = MultiplexedLockEngine::new(connection);
        let strategy = Arc::new(MemoryStrategy::new());
        let cancel = CancellationToken::new();

        let err = engine
            .try_acquire("A", five_seconds(), &strategy, &cancel, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert!(!engine.is_in_use());

        // The next attempt opens normally
        let handle = engine
            .try_acquire("A", five_seconds(), &strategy, &cancel, false)
            .await
            .unwrap()
            .into_handle()
            .unwrap();
        handle.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispose_with_held_lock_is_rejected() {
        let store = MemoryLockStore::new();
        let connection = store.connect();
        let stats = connection.stats();
        let engine = MultiplexedLockEngine::new(connection);
        let strategy = Arc::new(MemoryStrategy::new());
        let cancel = CancellationToken::new();

        let handle = engine
            .try_acquire("A", five_seconds(), &strategy, &cancel, false)
            .await
            .unwrap()
            .into_handle()
            .unwrap();

        let err = engine.dispose().await.unwrap_err();
        assert!(err.is_programming_error());
        assert!(err.to_string().contains("A"));
        assert!(!stats.is_disposed());

        handle.dispose().await.unwrap();
        engine.dispose().await.unwrap();
        assert!(stats.is_disposed());

        // Second dispose is a no-op
        engine.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_after_dispose_fails() {
        let store = MemoryLockStore::new();
        let engine = engine(&store);
        let strategy = Arc::new(MemoryStrategy::new());
        let cancel = CancellationToken::new();

        engine.dispose().await.unwrap();

        let err = engine
            .try_acquire("A", five_seconds(), &strategy, &cancel, true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_wait() {
        let store = MemoryLockStore::new();
        let engine = engine(&store);
        let strategy = Arc::new(MemoryStrategy::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine
            .try_acquire("A", five_seconds(), &strategy, &cancel, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(ref name) if name == "A"));
        assert_eq!(strategy.stats().acquire_calls(), 0);
    }

    #[tokio::test]
    async fn test_default_timeout_from_config() {
        let store = MemoryLockStore::new();
        let config = EngineConfig::default()
            .with_label("orders")
            .with_default_timeout(Timeout::from(Duration::from_millis(250)));
        let engine = MultiplexedLockEngine::with_config(store.connect(), config);

        assert_eq!(engine.label(), "orders");
        assert_eq!(
            engine.default_timeout(),
            Timeout::After(Duration::from_millis(250))
        );
        assert!(format!("{:?}", engine).contains("orders"));
    }
}
