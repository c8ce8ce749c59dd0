//! Tracing initialization for the CLI binary.

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber. `RUST_LOG` overrides
/// `default_level` when set.
pub fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .compact()
        .init();
}
