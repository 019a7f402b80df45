//! Counters for bus activity.
//!
//! One [`BusMetrics`] lives in each bus tree; [`MessageBus::metrics`] returns a
//! [`MetricsSnapshot`] that exporters (see the `bus-telemetry` crate) can
//! forward to an external system.
//!
//! [`MessageBus::metrics`]: crate::MessageBus::metrics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Thread-safe counters for one bus tree.
#[derive(Debug, Default)]
pub struct BusMetrics {
    /// Publishes that produced a message (delivered or queued)
    pub messages_published: AtomicU64,
    /// Posts queued behind an in-progress dispatch
    pub messages_queued: AtomicU64,
    /// Handler invocations attempted
    pub deliveries: AtomicU64,
    /// Handler invocations that failed (including cancellations)
    pub handler_failures: AtomicU64,
    /// Handler invocations that were cancelled
    pub cancellations: AtomicU64,
    /// Snapshotted handlers skipped because they went inert
    pub skipped_inert: AtomicU64,
    /// Connections created
    pub connections_created: AtomicU64,
    /// Connections disconnected
    pub connections_disconnected: AtomicU64,
    /// Compaction passes run
    pub compaction_passes: AtomicU64,
    /// Connection records removed by compaction
    pub records_compacted: AtomicU64,
    /// Nodes created, root included
    pub nodes_created: AtomicU64,
    /// Nodes disposed
    pub nodes_disposed: AtomicU64,
    /// Subscriptions removed by plugin unload
    pub plugin_subscriptions_removed: AtomicU64,
}

impl BusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            messages_published: load(&self.messages_published),
            messages_queued: load(&self.messages_queued),
            deliveries: load(&self.deliveries),
            handler_failures: load(&self.handler_failures),
            cancellations: load(&self.cancellations),
            skipped_inert: load(&self.skipped_inert),
            connections_created: load(&self.connections_created),
            connections_disconnected: load(&self.connections_disconnected),
            compaction_passes: load(&self.compaction_passes),
            records_compacted: load(&self.records_compacted),
            nodes_created: load(&self.nodes_created),
            nodes_disposed: load(&self.nodes_disposed),
            plugin_subscriptions_removed: load(&self.plugin_subscriptions_removed),
        }
    }
}

/// Point-in-time metrics snapshot
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub messages_published: u64,
    pub messages_queued: u64,
    pub deliveries: u64,
    pub handler_failures: u64,
    pub cancellations: u64,
    pub skipped_inert: u64,
    pub connections_created: u64,
    pub connections_disconnected: u64,
    pub compaction_passes: u64,
    pub records_compacted: u64,
    pub nodes_created: u64,
    pub nodes_disposed: u64,
    pub plugin_subscriptions_removed: u64,
}

impl MetricsSnapshot {
    /// Connections created and not yet disconnected.
    pub fn live_connections(&self) -> u64 {
        self.connections_created
            .saturating_sub(self.connections_disconnected)
    }

    /// Nodes created and not yet disposed.
    pub fn live_nodes(&self) -> u64 {
        self.nodes_created.saturating_sub(self.nodes_disposed)
    }
}
