//! Named locks multiplexed over a shared connection
//!
//! This module holds the lock engine that lets many named locks share one
//! scarce backend connection.
//!
//! # Architecture
//!
//! - **Boundary traits**: `SharedConnection` (the session) and `SyncStrategy`
//!   (how a backend takes and gives back a named lock)
//! - **Engine**: `MultiplexedLockEngine` owns one connection, tracks held
//!   names and serializes every lock command behind one async mutex
//! - **Handles**: `LockHandle` releases its lock exactly once
//! - **Retry policy**: `retry::decide` tells an outer pool where to retry
//!   after a failed attempt
//!
//! # Example
//!
//! ```ignore
//! use muxlock_core::locking::{AcquireOutcome, MultiplexedLockEngine, Timeout};
//!
//! let engine = MultiplexedLockEngine::new(connection);
//!
//! match engine.try_acquire("orders", Timeout::from(Duration::from_secs(5)), &strategy, &cancel, false).await? {
//!     AcquireOutcome::Acquired(handle) => {
//!         // Do work while holding the lock...
//!         handle.dispose().await?;
//!     }
//!     AcquireOutcome::Busy { retry, .. } => {
//!         // Hand the retry decision to the pool
//!     }
//! }
//! ```

pub mod engine;
pub mod handle;
pub mod retry;
pub mod strategy;
pub mod types;

// Re-export main types
pub use engine::MultiplexedLockEngine;
pub use handle::LockHandle;
pub use retry::FailedAttempt;
pub use strategy::{SharedConnection, SyncStrategy};
pub use types::{AcquireOutcome, HeldLock, RetryDecision, Timeout};
