//! Muxlock Core Library
//!
//! This crate provides named distributed locks whose ownership is arbitrated
//! by an external store, with many locks sharing one backend connection:
//! - Connection-multiplexing lock engine
//! - Exactly-once lock handles with async and blocking disposal
//! - Retry decisions for pools probing several engines
//! - In-process reference backend
//! - Configuration and logging setup

pub mod config;
pub mod error;
pub mod locking;
pub mod logging;
pub mod memory;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::error::{Error, Result};
    pub use crate::locking::{
        AcquireOutcome, LockHandle, MultiplexedLockEngine, RetryDecision, SharedConnection,
        SyncStrategy, Timeout,
    };
}
