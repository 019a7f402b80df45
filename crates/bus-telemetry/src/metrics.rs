//! Prometheus export of bus counters.
//!
//! All metrics follow the naming convention: `bus_<metric>[_total]`, labelled
//! by `bus` (the exporter's name for one bus tree).
//!
//! ## Metric Types
//!
//! - **Counter** `bus_events_total{bus, event}`: one series per
//!   [`MetricsSnapshot`] counter.
//! - **Gauge** `bus_live_connections{bus}` / `bus_live_nodes{bus}`.

use lazy_static::lazy_static;
use message_bus::MetricsSnapshot;
use parking_lot::Mutex;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Bus activity counters
    pub static ref BUS_EVENTS: IntCounterVec = IntCounterVec::new(
        Opts::new("bus_events_total", "Message bus activity by event kind"),
        &["bus", "event"]
    ).expect("metric creation failed");

    /// Connections created and not yet disconnected
    pub static ref BUS_LIVE_CONNECTIONS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("bus_live_connections", "Connections not yet disconnected"),
        &["bus"]
    ).expect("metric creation failed");

    /// Nodes created and not yet disposed
    pub static ref BUS_LIVE_NODES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("bus_live_nodes", "Bus nodes not yet disposed"),
        &["bus"]
    ).expect("metric creation failed");
}

/// Register all bus metrics with the global registry.
///
/// Registering twice is not an error.
pub fn register_metrics() -> Result<(), TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(BUS_EVENTS.clone()),
        Box::new(BUS_LIVE_CONNECTIONS.clone()),
        Box::new(BUS_LIVE_NODES.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }
    Ok(())
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

fn counters(s: &MetricsSnapshot) -> [(&'static str, u64); 13] {
    [
        ("messages_published", s.messages_published),
        ("messages_queued", s.messages_queued),
        ("deliveries", s.deliveries),
        ("handler_failures", s.handler_failures),
        ("cancellations", s.cancellations),
        ("skipped_inert", s.skipped_inert),
        ("connections_created", s.connections_created),
        ("connections_disconnected", s.connections_disconnected),
        ("compaction_passes", s.compaction_passes),
        ("records_compacted", s.records_compacted),
        ("nodes_created", s.nodes_created),
        ("nodes_disposed", s.nodes_disposed),
        ("plugin_subscriptions_removed", s.plugin_subscriptions_removed),
    ]
}

/// Mirrors the snapshots of one bus tree into the global registry.
///
/// Counters advance by the difference from the previously recorded snapshot,
/// so recording the same snapshot twice is a no-op.
pub struct BusMetricsExporter {
    bus: String,
    last: Mutex<MetricsSnapshot>,
}

impl BusMetricsExporter {
    pub fn new(bus: impl Into<String>) -> Self {
        Self {
            bus: bus.into(),
            last: Mutex::new(MetricsSnapshot::default()),
        }
    }

    pub fn bus(&self) -> &str {
        &self.bus
    }

    /// Records `snapshot`.
    pub fn record(&self, snapshot: &MetricsSnapshot) {
        let mut last = self.last.lock();
        for ((event, now), (_, before)) in counters(snapshot).into_iter().zip(counters(&last)) {
            let delta = now.saturating_sub(before);
            if delta > 0 {
                BUS_EVENTS.with_label_values(&[self.bus.as_str(), event]).inc_by(delta);
            }
        }
        BUS_LIVE_CONNECTIONS
            .with_label_values(&[self.bus.as_str()])
            .set(gauge(snapshot.live_connections()));
        BUS_LIVE_NODES
            .with_label_values(&[self.bus.as_str()])
            .set(gauge(snapshot.live_nodes()));
        *last = snapshot.clone();
    }

    /// Current value of one event counter for this bus.
    pub fn event_count(&self, event: &str) -> u64 {
        BUS_EVENTS.with_label_values(&[self.bus.as_str(), event]).get()
    }
}

fn gauge(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
