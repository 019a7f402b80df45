//! Structured logging helpers.
//!
//! Bus log lines share a fixed set of fields so log pipelines can group them:
//! - `bus`: exporter/tree name
//! - `node`: bus node id
//! - `topic`: topic name
//! - additional context fields

/// Log a bus event with the `bus` field set.
#[macro_export]
macro_rules! log_bus_event {
    ($level:ident, $bus:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            bus = $bus,
            $($($field)*,)?
            $msg
        )
    };
}

/// Log a topic-scoped event with standard fields.
#[macro_export]
macro_rules! log_topic_event {
    ($level:ident, $bus:expr, $msg:expr, $node:expr, $topic:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            bus = $bus,
            node = %$node,
            topic = %$topic,
            $($($field)*,)?
            $msg
        )
    };
}

/// Logs a metrics snapshot at `info`.
pub fn log_snapshot(bus: &str, snapshot: &message_bus::MetricsSnapshot) {
    crate::log_bus_event!(
        info,
        bus,
        "Bus metrics",
        published = snapshot.messages_published,
        deliveries = snapshot.deliveries,
        failures = snapshot.handler_failures,
        live_connections = snapshot.live_connections(),
        live_nodes = snapshot.live_nodes()
    );
}

/// Logs every failure of an aggregated delivery at `warn`, primary first.
pub fn log_delivery_error(bus: &str, error: &message_bus::DeliveryError) {
    for (index, failure) in error.failures().enumerate() {
        let is_primary = index == 0;
        crate::log_topic_event!(
            warn,
            bus,
            "Handler failed",
            failure.node,
            failure.topic,
            connection = %failure.connection,
            error = %failure.error,
            primary = is_primary
        );
    }
}
