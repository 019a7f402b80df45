//! # Bus Telemetry
//!
//! Observability for the message bus.
//!
//! ## Components
//!
//! - **Tracing**: global `tracing-subscriber` registry with `EnvFilter` and a
//!   console or JSON layer
//! - **Metrics**: Prometheus export of [`message_bus::MetricsSnapshot`]s
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bus_telemetry::{init_telemetry, BusMetricsExporter, TelemetryConfig};
//! use message_bus::RootBus;
//!
//! let _guard = init_telemetry(TelemetryConfig::from_env())?;
//! let root = RootBus::new();
//! let exporter = BusMetricsExporter::new("application");
//!
//! // periodically
//! exporter.record(&root.metrics());
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `BUS_LOG_LEVEL` / `RUST_LOG` | `info` | Log level filter |
//! | `BUS_JSON_LOGS` | `false` | JSON log lines |
//! | `BUS_CONSOLE_OUTPUT` | `true` | Console layer on/off |
//! | `BUS_SERVICE_NAME` | `message-bus` | Service name in startup logs |

mod config;
mod logging;
mod metrics;
mod tracing_setup;

pub use config::TelemetryConfig;
pub use logging::{log_delivery_error, log_snapshot};
pub use metrics::{
    encode_metrics, register_metrics, BusMetricsExporter, BUS_EVENTS, BUS_LIVE_CONNECTIONS,
    BUS_LIVE_NODES, REGISTRY,
};
pub use tracing_setup::{build_filter, init_tracing};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter: {0}")]
    Filter(String),

    #[error("Failed to install tracing subscriber: {0}")]
    SubscriberInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),
}

/// Initialize tracing and register bus metrics.
///
/// Returns a guard that must be held for the lifetime of the application.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    // Initialize metrics first
    register_metrics()?;

    tracing_setup::init_tracing(&config)?;

    Ok(TelemetryGuard {
        service_name: config.service_name,
    })
}

/// Guard that keeps telemetry active.
pub struct TelemetryGuard {
    service_name: String,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!(service = %self.service_name, "Shutting down telemetry...");
    }
}
