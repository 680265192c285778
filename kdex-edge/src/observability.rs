//! Tracing bootstrap

use tracing_subscriber::EnvFilter;

use crate::config::EdgeConfig;

/// Initialize tracing with JSON formatting and env-filter support
///
/// The filter defaults to the configured log level; `RUST_LOG` overrides it.
pub fn init_tracing(config: &EdgeConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .init();

    tracing::info!(bind_addr = %config.server.bind_addr, "tracing initialized");
}
