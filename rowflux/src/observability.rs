//! Structured logging setup

use tracing_subscriber::EnvFilter;

use crate::{config::Config, error::Result};

/// Initialize JSON tracing output filtered by the configured log level
///
/// Calling this more than once is harmless; later calls leave the first
/// subscriber in place.
pub fn init_tracing(config: &Config) -> Result<()> {
    let log_level = config.service.log_level.clone();

    let installed = tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(
            service = %config.service.name,
            environment = %config.service.environment,
            queue_size = config.stream.queue_size,
            buffer_timeout_ms = config.stream.buffer_timeout_ms,
            "Tracing initialized"
        );
    }

    Ok(())
}

/// Shutdown tracing and flush spans
pub fn shutdown_tracing() {
    tracing::info!("Tracing shutdown complete");
}
