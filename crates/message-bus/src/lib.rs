//! # Message Bus
//!
//! Hierarchical, topic-based, synchronous publish/subscribe.
//!
//! ## Architecture
//!
//! ```text
//!                 RootBus (application)
//!                ┌──────┴──────┐
//!        MessageBus (project)  MessageBus (project)
//!           ┌────┴────┐
//!     MessageBus    MessageBus (module)
//! ```
//!
//! - **Topics** (`topic`): typed channels with a [`BroadcastDirection`].
//! - **Connections** (`connection`): subscriber handles grouping
//!   subscriptions under one lifecycle.
//! - **Tree** (`tree`): arena of nodes behind one `RwLock`, with per-node
//!   handler caches.
//! - **Dispatch** (`dispatch`): iterative, re-entrant fan-out with failure
//!   isolation.
//! - **Compaction** (`compaction`): debounced background removal of inert
//!   connection records.
//! - **Scopes** (`scope`): disposal hooks that own connections and nodes.
//!
//! ## Invariants
//!
//! - Within a node, handlers run in connect order, then subscribe order.
//! - A nested publish is fully delivered before the handler that issued it
//!   continues.
//! - A failing or panicking handler never stops the fan-out.
//! - No handler runs while a bus lock is held.
//!
//! ## Usage Example
//!
//! ```
//! use std::sync::Arc;
//! use message_bus::{RootBus, Topic};
//!
//! trait FileListener: Send + Sync {
//!     fn saved(&self, path: &str);
//! }
//!
//! struct Printer;
//! impl FileListener for Printer {
//!     fn saved(&self, path: &str) {
//!         println!("saved {path}");
//!     }
//! }
//!
//! let root = RootBus::new();
//! let topic = Topic::<dyn FileListener>::new("file events");
//!
//! let connection = root.connect()?;
//! connection.subscribe(&topic, Arc::new(Printer))?;
//!
//! root.sync_publisher(&topic).publish(|l| l.saved("Cargo.toml"))?;
//! # Ok::<(), message_bus::BusError>(())
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod bus;
pub mod compaction;
pub mod config;
pub mod connection;
mod dispatch;
pub mod error;
pub mod metrics;
pub mod scope;
pub mod topic;
mod tree;

/// Disconnects between background compaction passes unless configured.
pub const DEFAULT_COMPACTION_THRESHOLD: usize = 128;

// Re-exports for convenience
pub use bus::{MessageBus, Publisher, RootBus};
pub use compaction::{CompactionExecutor, InlineExecutor, ThreadExecutor, TokioExecutor};
pub use config::BusConfig;
pub use connection::{ConnectionId, MessageBusConnection, PluginId};
pub use error::{BusError, Cancellation, DeliveryError, HandlerError, HandlerFailure};
pub use metrics::{BusMetrics, MetricsSnapshot};
pub use scope::{DisposalScope, DisposeHook, HookId, Scope};
pub use topic::{BroadcastDirection, Topic, TopicId};
pub use tree::NodeId;
