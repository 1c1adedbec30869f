//! Logging configuration
//!
//! Log lines go to stderr so `keygen` and `hash-password` output stays
//! clean on stdout.

use tracing::Level;
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVE: &str = "tor_operator=info";

/// Initialize logging from `RUST_LOG`, falling back to info for this crate
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .init();
}

/// Initialize logging at `level` (`-v` selects debug)
pub fn init_with_level(level: Level) {
    let filter = EnvFilter::new(format!("tor_operator={}", level));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}
