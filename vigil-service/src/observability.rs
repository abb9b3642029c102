//! Tracing initialization

use tracing_subscriber::EnvFilter;

use crate::{config::ServerConfig, error::Result};

/// Initialize JSON tracing output filtered by the configured log level
///
/// Falls back to `info` when the configured level does not parse as an
/// `EnvFilter` directive.
pub fn init_tracing(config: &ServerConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Tracing initialized for service: {}", config.service_name);

    Ok(())
}
