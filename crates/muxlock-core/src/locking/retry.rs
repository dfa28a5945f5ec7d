//! Retry decision for failed acquisition attempts

use super::types::RetryDecision;

/// Inputs describing why an attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailedAttempt {
    pub opportunistic: bool,
    /// The engine already held the requested name
    pub is_already_held: bool,
    pub timeout_is_zero: bool,
    /// The engine holds at least one lock after the attempt
    pub holding_others: bool,
}

/// Decide where to retry and whether the engine is safe to dispose
///
/// A non-opportunistic attempt was a real wait, so it is never retried here.
/// An opportunistic probe that lost to work already on this engine should go
/// elsewhere; one that lost on an idle engine can repeat on it with the real
/// timeout, which is cheaper than finding another connection.
pub fn decide(attempt: FailedAttempt) -> (RetryDecision, bool) {
    let idle = !attempt.holding_others;

    if !attempt.opportunistic {
        return (RetryDecision::NoRetry, idle);
    }

    if attempt.is_already_held {
        return (RetryDecision::RetryOnOtherEngine, false);
    }

    if attempt.timeout_is_zero {
        return (RetryDecision::NoRetry, idle);
    }

    if idle {
        (RetryDecision::RetryOnThisEngine, true)
    } else {
        (RetryDecision::RetryOnOtherEngine, false)
    }
}
