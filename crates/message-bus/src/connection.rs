//! # Connections
//!
//! A [`MessageBusConnection`] is a subscriber's handle on one bus node. It
//! groups any number of (topic → handler) subscriptions under one lifecycle:
//!
//! ```text
//! MessageBus::connect() ──► MessageBusConnection
//!                              ├─ subscribe(TOPIC_A, handler_1)
//!                              ├─ subscribe(TOPIC_A, handler_2)   (delivered after handler_1)
//!                              └─ subscribe(TOPIC_B, handler_3)
//!
//! disconnect() / owner scope disposed
//!     └─► connection inert: no further invocations, record kept until compaction
//! ```
//!
//! Dropping the handle does not disconnect. The record stays on its node
//! until [`MessageBusConnection::disconnect`] is called, the owning scope is
//! disposed, or the node itself is disposed.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::bus::BusShared;
use crate::error::BusError;
use crate::scope::ScopeBinding;
use crate::topic::{Topic, TopicId, TopicMeta};
use crate::tree::NodeId;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Group tag for subscriptions that belong to a dynamically loaded unit.
///
/// [`RootBus::disconnect_plugin_connections`](crate::RootBus::disconnect_plugin_connections)
/// removes subscriptions by group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PluginId(Arc<str>);

impl PluginId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PluginId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PluginId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One (topic → handler) registration.
pub(crate) struct Subscription {
    pub(crate) topic: Arc<TopicMeta>,
    /// Holds an `Arc<L>` for the topic's listener type `L`.
    pub(crate) listener: Arc<dyn Any + Send + Sync>,
    pub(crate) group: Option<PluginId>,
    active: AtomicBool,
}

impl Subscription {
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }
}

/// Connection state shared between the handle, the owning node and any
/// in-flight message snapshots.
pub(crate) struct ConnectionInner {
    pub(crate) id: ConnectionId,
    pub(crate) node: NodeId,
    pub(crate) group: Option<PluginId>,
    disconnected: AtomicBool,
    pub(crate) subscriptions: Mutex<Vec<Arc<Subscription>>>,
    pub(crate) scope: Mutex<Option<ScopeBinding>>,
}

impl ConnectionInner {
    pub(crate) fn new(node: NodeId, group: Option<PluginId>) -> Self {
        Self {
            id: ConnectionId::next(),
            node,
            group,
            disconnected: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
            scope: Mutex::new(None),
        }
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Marks the connection inert and deactivates every subscription.
    ///
    /// Returns the topics that were subscribed, or `None` if the connection
    /// was already inert.
    pub(crate) fn shut_down(&self) -> Option<Vec<Arc<TopicMeta>>> {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return None;
        }
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        let mut topics: Vec<Arc<TopicMeta>> = Vec::new();
        for sub in subscriptions {
            sub.deactivate();
            if !topics.iter().any(|t| t.id == sub.topic.id) {
                topics.push(Arc::clone(&sub.topic));
            }
        }
        if let Some(binding) = self.scope.lock().take() {
            binding.release();
        }
        Some(topics)
    }

    /// Live subscriptions for `topic`, in registration order.
    pub(crate) fn live_subscriptions(&self, topic: TopicId) -> Vec<Arc<Subscription>> {
        if self.is_disconnected() {
            return Vec::new();
        }
        self.subscriptions
            .lock()
            .iter()
            .filter(|s| s.topic.id == topic && s.is_active())
            .cloned()
            .collect()
    }
}

/// A subscriber's registration handle on one bus node.
#[derive(Clone)]
pub struct MessageBusConnection {
    pub(crate) inner: Arc<ConnectionInner>,
    pub(crate) shared: Arc<BusShared>,
}

impl MessageBusConnection {
    /// Connection identity.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Node this connection belongs to.
    pub fn node(&self) -> NodeId {
        self.inner.node
    }

    /// Default group applied by [`Self::subscribe`].
    pub fn group(&self) -> Option<&PluginId> {
        self.inner.group.as_ref()
    }

    /// Subscribes `handler` to `topic` under the connection's default group.
    ///
    /// Handlers on one connection are delivered in subscription order.
    ///
    /// # Errors
    ///
    /// [`BusError::ConnectionDisconnected`] if the connection is inert; nothing
    /// is registered.
    pub fn subscribe<L>(&self, topic: &Topic<L>, handler: Arc<L>) -> Result<(), BusError>
    where
        L: ?Sized + Send + Sync + 'static,
    {
        self.register(topic, self.inner.group.clone(), handler)
    }

    /// Subscribes `handler` to `topic`, tagged with `group`.
    ///
    /// # Errors
    ///
    /// [`BusError::ConnectionDisconnected`] if the connection is inert.
    pub fn subscribe_in_group<L>(
        &self,
        topic: &Topic<L>,
        group: impl Into<PluginId>,
        handler: Arc<L>,
    ) -> Result<(), BusError>
    where
        L: ?Sized + Send + Sync + 'static,
    {
        self.register(topic, Some(group.into()), handler)
    }

    fn register<L>(
        &self,
        topic: &Topic<L>,
        group: Option<PluginId>,
        handler: Arc<L>,
    ) -> Result<(), BusError>
    where
        L: ?Sized + Send + Sync + 'static,
    {
        let subscription = Arc::new(Subscription {
            topic: Arc::clone(topic.meta()),
            listener: Arc::new(handler),
            group,
            active: AtomicBool::new(true),
        });

        {
            // Checked under the list lock so a racing disconnect either sees
            // this subscription or rejects it.
            let mut subs = self.inner.subscriptions.lock();
            if self.inner.is_disconnected() {
                drop(subs);
                warn!(
                    connection = %self.inner.id,
                    topic = %topic.name(),
                    "Subscribe on disconnected connection ignored"
                );
                return Err(BusError::ConnectionDisconnected {
                    connection: self.inner.id,
                });
            }
            subs.push(subscription);
        }

        self.shared.invalidate_topic(self.inner.node, topic.meta());

        debug!(
            connection = %self.inner.id,
            node = %self.inner.node,
            topic = %topic.name(),
            direction = %topic.direction(),
            "Subscribed"
        );
        Ok(())
    }

    /// Makes the connection inert. Safe to call any number of times.
    ///
    /// Publishes that start afterwards skip its handlers; a fan-out already in
    /// progress skips the ones it has not reached yet.
    pub fn disconnect(&self) {
        self.shared.disconnect(&self.inner);
    }

    /// Whether [`Self::disconnect`] ran (directly or via scope/node disposal).
    pub fn is_disconnected(&self) -> bool {
        self.inner.is_disconnected()
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner
            .subscriptions
            .lock()
            .iter()
            .filter(|s| s.is_active())
            .count()
    }
}

impl fmt::Debug for MessageBusConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBusConnection")
            .field("id", &self.inner.id)
            .field("node", &self.inner.node)
            .field("group", &self.inner.group)
            .field("disconnected", &self.inner.is_disconnected())
            .finish()
    }
}
