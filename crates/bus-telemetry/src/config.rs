//! Telemetry configuration from environment variables.

use std::env;

/// Configuration for bus logging and metrics export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name attached to startup logs and metric labels
    pub service_name: String,

    /// Log level filter (trace, debug, info, warn, error, or a full directive)
    pub log_level: String,

    /// Whether to enable console output
    pub console_output: bool,

    /// Whether to enable JSON formatted logs
    pub json_logs: bool,

    /// Whether log lines carry thread ids (useful when tracing fan-out)
    pub thread_ids: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "message-bus".to_string(),
            log_level: "info".to_string(),
            console_output: true,
            json_logs: false,
            thread_ids: false,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `BUS_SERVICE_NAME`: Service name (default: message-bus)
    /// - `BUS_LOG_LEVEL` or `RUST_LOG`: Log level (default: info)
    /// - `BUS_CONSOLE_OUTPUT`: Enable console output (default: true)
    /// - `BUS_JSON_LOGS`: Enable JSON logs (default: false, true in containers)
    /// - `BUS_THREAD_IDS`: Include thread ids (default: false)
    pub fn from_env() -> Self {
        let is_container =
            env::var("KUBERNETES_SERVICE_HOST").is_ok() || env::var("DOCKER_CONTAINER").is_ok();

        Self {
            service_name: env::var("BUS_SERVICE_NAME")
                .unwrap_or_else(|_| "message-bus".to_string()),

            log_level: env::var("BUS_LOG_LEVEL")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),

            console_output: env::var("BUS_CONSOLE_OUTPUT")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(true),

            json_logs: env::var("BUS_JSON_LOGS")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(is_container),

            thread_ids: env::var("BUS_THREAD_IDS")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    /// Configuration for tests: debug level, console only, no JSON.
    pub fn for_tests() -> Self {
        Self {
            service_name: "message-bus-tests".to_string(),
            log_level: "message_bus=debug".to_string(),
            thread_ids: true,
            ..Self::default()
        }
    }
}
