//! Bus configuration from defaults or environment variables.

use std::env;

use serde::{Deserialize, Serialize};

use crate::DEFAULT_COMPACTION_THRESHOLD;

/// Configuration for a [`RootBus`](crate::RootBus) and its tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Disconnects counted before a background compaction pass is scheduled
    pub compaction_threshold: usize,

    /// Whether the threshold schedules compaction automatically
    pub background_compaction: bool,

    /// Name of the OS thread used by the default compaction executor
    pub compaction_thread_name: String,

    /// Whether handler failures are logged at `warn` during fan-out
    pub log_handler_failures: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            background_compaction: true,
            compaction_thread_name: "message-bus-compaction".to_string(),
            log_handler_failures: true,
        }
    }
}

impl BusConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `BUS_COMPACTION_THRESHOLD`: disconnects per compaction (default: 128)
    /// - `BUS_BACKGROUND_COMPACTION`: enable background compaction (default: true)
    /// - `BUS_COMPACTION_THREAD`: compaction thread name (default: message-bus-compaction)
    /// - `BUS_LOG_HANDLER_FAILURES`: log handler failures (default: true)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            compaction_threshold: env::var("BUS_COMPACTION_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.compaction_threshold),

            background_compaction: env::var("BUS_BACKGROUND_COMPACTION")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.background_compaction),

            compaction_thread_name: env::var("BUS_COMPACTION_THREAD")
                .unwrap_or(defaults.compaction_thread_name),

            log_handler_failures: env::var("BUS_LOG_HANDLER_FAILURES")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.log_handler_failures),
        }
    }

    /// Threshold clamped to at least one disconnect.
    pub fn effective_threshold(&self) -> usize {
        self.compaction_threshold.max(1)
    }

    /// Builder-style threshold override.
    #[must_use]
    pub fn with_compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = threshold;
        self
    }

    /// Builder-style toggle for background compaction.
    #[must_use]
    pub fn with_background_compaction(mut self, enabled: bool) -> Self {
        self.background_compaction = enabled;
        self
    }
}

fn parse_flag(value: &str) -> bool {
    let v = value.trim().to_lowercase();
    v != "false" && v != "0" && v != "off"
}
