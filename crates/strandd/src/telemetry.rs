//! Tracing initialization for the Strand daemon.

use tracing_subscriber::EnvFilter;

/// Initialize the `tracing` subscriber.
///
/// Respects `RUST_LOG` if set, otherwise uses the configured level. Call
/// once at startup, before any events are emitted.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
