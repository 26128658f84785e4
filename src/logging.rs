//! Logging configuration using tracing
//!
//! Structured logging to stderr, filtered through the RUST_LOG environment variable.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter for the server when RUST_LOG is unset
pub const DEFAULT_FILTER: &str = "info";

/// Initialize the tracing subscriber
///
/// `level` is used when RUST_LOG is not set. Examples:
/// - `RUST_LOG=debug` - Show debug and above
/// - `RUST_LOG=pushrelay=trace,axum=info` - Per-crate levels
///
/// # Errors
/// Returns an error if the subscriber has already been initialized
pub fn init(level: &str) -> crate::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true),
        )
        .try_init()
        .map_err(|e| crate::RelayError::Other(format!("Failed to initialize tracing: {}", e)))?;

    Ok(())
}

/// Initialize logging for tests (no-op if already initialized)
pub fn init_test() {
    let _ = init("debug");
}
