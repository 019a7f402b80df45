//! `tracing` subscriber setup.
//!
//! Installs a global registry with an [`EnvFilter`] and, when console output
//! is enabled, either a human-readable or a JSON formatting layer.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::{TelemetryConfig, TelemetryError};

/// Builds the level filter: `RUST_LOG` wins over the configured level.
pub fn build_filter(config: &TelemetryConfig) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| TelemetryError::Filter(e.to_string()))
}

/// Installs the global subscriber.
///
/// Fails if a global subscriber is already set.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = build_filter(config)?;

    let console_layer = if !config.console_output {
        None
    } else if config.json_logs {
        // JSON output for containers/production
        Some(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .boxed(),
        )
    } else {
        // Pretty output for development
        Some(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(config.thread_ids)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(true)
                .boxed(),
        )
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    tracing::info!(
        service = %config.service_name,
        json = config.json_logs,
        "Bus tracing initialized"
    );
    Ok(())
}
