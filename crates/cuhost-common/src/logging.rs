use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable read for the log filter directive.
pub const LOG_ENV: &str = "CUHOST_LOG";

/// Initialize structured logging with environment filter.
/// Set CUHOST_LOG=debug (or trace, info, warn, error) for verbosity control.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Like [`init_logging`], but tolerates a subscriber already being installed.
/// Returns `false` when another subscriber won.
pub fn try_init_logging() -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .is_ok()
}
