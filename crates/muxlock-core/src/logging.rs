//! Tracing subscriber setup

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "MUXLOCK_LOG";

/// Install a formatting subscriber filtered by `MUXLOCK_LOG`, falling back to
/// `muxlock_core=info`
///
/// Returns `false` if a global subscriber was already installed.
pub fn init() -> bool {
    init_with_default("muxlock_core=info")
}

/// Like [`init`] with a custom fallback directive
pub fn init_with_default(directive: &str) -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
