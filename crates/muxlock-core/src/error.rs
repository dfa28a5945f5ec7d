//! Error types for muxlock

use thiserror::Error;

/// Result type alias using muxlock's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Muxlock error types
///
/// Contention is never reported through this type: a lock that could not be
/// taken comes back as [`crate::locking::AcquireOutcome::Busy`].
#[derive(Error, Debug)]
pub enum Error {
    // Cancellation errors (E100-E199)
    #[error("Operation cancelled while waiting for lock '{0}'")]
    Cancelled(String),

    // Connection errors (E200-E299)
    #[error("Connection error: {0}")]
    Connection(String),

    // Strategy errors (E300-E399)
    #[error("Lock strategy failed for '{name}': {reason}")]
    Strategy { name: String, reason: String },

    // Invariant errors (E400-E499)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    // Runtime errors (E500-E599)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Build a strategy error for the given lock name
    pub fn strategy(name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Strategy {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::Cancelled(_) => "E100",
            Self::Connection(_) => "E200",
            Self::Strategy { .. } => "E300",
            Self::InvariantViolation(_) => "E400",
            Self::Runtime(_) => "E500",
        }
    }

    /// Whether this error reports a caller contract breach rather than an
    /// operational failure
    pub fn is_programming_error(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}
