//! Lock types shared by the engine, its handles and callers

use super::handle::LockHandle;
use super::strategy::{SharedConnection, SyncStrategy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// How long a strategy may wait for a contended lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeout {
    /// Wait at most this long (zero means a single non-waiting attempt)
    After(Duration),
    /// Wait until the lock is available or the operation is cancelled
    Infinite,
}

impl Timeout {
    /// A single attempt that never waits
    pub const ZERO: Timeout = Timeout::After(Duration::ZERO);

    /// Check if this is a finite zero timeout
    pub fn is_zero(&self) -> bool {
        matches!(self, Self::After(d) if d.is_zero())
    }

    /// Check if this timeout never expires
    pub fn is_infinite(&self) -> bool {
        matches!(self, Self::Infinite)
    }

    /// Get the finite duration, if any
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::After(d) => Some(*d),
            Self::Infinite => None,
        }
    }

    /// Milliseconds for log fields (`None` when infinite)
    pub fn as_millis(&self) -> Option<u128> {
        self.as_duration().map(|d| d.as_millis())
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Self::After(duration)
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(duration: Option<Duration>) -> Self {
        duration.map_or(Self::Infinite, Self::After)
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::After(d) => write!(f, "{}ms", d.as_millis()),
            Self::Infinite => write!(f, "infinite"),
        }
    }
}

/// Where a caller should retry after a failed acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDecision {
    /// The attempt was a real one; report failure to the caller
    NoRetry,
    /// Retry with the caller's full timeout on the same engine
    RetryOnThisEngine,
    /// Look for a different engine (or a fresh connection)
    RetryOnOtherEngine,
}

impl RetryDecision {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoRetry => "no_retry",
            Self::RetryOnThisEngine => "retry_on_this_engine",
            Self::RetryOnOtherEngine => "retry_on_other_engine",
        }
    }
}

impl fmt::Display for RetryDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of a single acquisition attempt on one engine
pub enum AcquireOutcome<C, S>
where
    C: SharedConnection,
    S: SyncStrategy<C>,
{
    /// The lock is held; dispose the handle to release it
    Acquired(LockHandle<C, S>),
    /// The lock was not taken
    Busy {
        retry: RetryDecision,
        /// Whether the engine held no locks when the attempt finished, so an
        /// outer pool may dispose it
        can_safely_dispose: bool,
    },
}

impl<C, S> AcquireOutcome<C, S>
where
    C: SharedConnection,
    S: SyncStrategy<C>,
{
    /// Check if the lock was acquired
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }

    /// Take the handle, if acquired
    pub fn into_handle(self) -> Option<LockHandle<C, S>> {
        match self {
            Self::Acquired(handle) => Some(handle),
            Self::Busy { .. } => None,
        }
    }

    /// The retry decision, if busy
    pub fn retry(&self) -> Option<RetryDecision> {
        match self {
            Self::Acquired(_) => None,
            Self::Busy { retry, .. } => Some(*retry),
        }
    }

    /// Whether the engine may be disposed (always false when acquired)
    pub fn can_safely_dispose(&self) -> bool {
        match self {
            Self::Acquired(_) => false,
            Self::Busy {
                can_safely_dispose, ..
            } => *can_safely_dispose,
        }
    }
}

impl<C, S> fmt::Debug for AcquireOutcome<C, S>
where
    C: SharedConnection,
    S: SyncStrategy<C>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acquired(handle) => f.debug_tuple("Acquired").field(handle).finish(),
            Self::Busy {
                retry,
                can_safely_dispose,
            } => f
                .debug_struct("Busy")
                .field("retry", retry)
                .field("can_safely_dispose", can_safely_dispose)
                .finish(),
        }
    }
}

/// Information about a lock currently held on an engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeldLock {
    /// Lock name
    pub name: String,

    /// When the engine recorded the acquisition
    pub acquired_at: DateTime<Utc>,
}
