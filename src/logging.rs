//! Logging initialization.
//!
//! The RUST_LOG environment variable takes precedence over the configured level.

use crate::config::LoggingConfig;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging based on configuration.
pub fn init(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_thread_names(true))
                .init();
        }
        "compact" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact().with_thread_names(true))
                .init();
        }
        _ => {
            // "pretty" or default
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_thread_names(true))
                .init();
        }
    }
}
