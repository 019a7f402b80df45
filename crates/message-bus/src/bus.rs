//! # Bus nodes, publishers and the root
//!
//! ```text
//!                      RootBus ──► BusShared ─┬─ RwLock<Tree>      (topology, caches)
//!                         │                   ├─ BusMetrics
//!                         │ Deref             ├─ BusConfig
//!                         ▼                   └─ DebouncedTask     (compaction)
//!   MessageBus { shared, node } ──create_child──► MessageBus { shared, child }
//!       │
//!       ├─ connect() ─────────► MessageBusConnection
//!       └─ sync_publisher(T) ─► Publisher<L> ── publish(|l| l.method(..))
//! ```
//!
//! Every node handle of one tree shares a single [`BusShared`]. A publish
//! takes the tree read lock only long enough to fetch its handler snapshot,
//! then runs every handler with no lock held.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::compaction::{CompactionExecutor, DebouncedTask, ThreadExecutor};
use crate::config::BusConfig;
use crate::connection::{ConnectionInner, MessageBusConnection, PluginId};
use crate::dispatch::{self, DispatchGuard, Invoker, MessageState, QueuedMessage};
use crate::error::{BusError, DeliveryError, HandlerError, HandlerFailure};
use crate::metrics::{BusMetrics, MetricsSnapshot};
use crate::scope::{DisposalScope, ScopeBinding};
use crate::topic::{Topic, TopicMeta};
use crate::tree::{NodeId, Tree};

static NEXT_TREE_ID: AtomicU64 = AtomicU64::new(1);

/// State shared by every node handle of one bus tree.
pub(crate) struct BusShared {
    tree_id: u64,
    tree: RwLock<Tree>,
    config: BusConfig,
    metrics: BusMetrics,
    compaction: Arc<DebouncedTask>,
    inert_connections: AtomicUsize,
}

impl BusShared {
    fn new(config: BusConfig, executor: Arc<dyn CompactionExecutor>) -> Arc<Self> {
        let shared = Arc::new_cyclic(|weak: &Weak<BusShared>| {
            let weak = weak.clone();
            let compaction = DebouncedTask::new("compaction", executor, move || {
                if let Some(shared) = weak.upgrade() {
                    shared.compact();
                }
            });
            Self {
                tree_id: NEXT_TREE_ID.fetch_add(1, Ordering::Relaxed),
                tree: RwLock::new(Tree::new()),
                config,
                metrics: BusMetrics::new(),
                compaction,
                inert_connections: AtomicUsize::new(0),
            }
        });
        BusMetrics::incr(&shared.metrics.nodes_created);
        shared
    }

    fn root(&self) -> NodeId {
        self.tree.read().root()
    }

    pub(crate) fn invalidate_topic(&self, node: NodeId, topic: &Arc<TopicMeta>) {
        self.tree.write().invalidate_topic(node, topic);
    }

    fn connect(
        &self,
        node: NodeId,
        group: Option<PluginId>,
    ) -> Result<Arc<ConnectionInner>, BusError> {
        let inner = Arc::new(ConnectionInner::new(node, group));
        {
            let mut tree = self.tree.write();
            let Some(entry) = tree.node_mut(node) else {
                drop(tree);
                warn!(node = %node, "Connect on disposed bus node");
                return Err(BusError::NodeDisposed { node });
            };
            entry.connections.push(Arc::clone(&inner));
        }
        BusMetrics::incr(&self.metrics.connections_created);
        debug!(node = %node, connection = %inner.id, group = ?inner.group, "Connected");
        Ok(inner)
    }

    /// Makes `connection` inert and drops every cache it contributed to.
    pub(crate) fn disconnect(&self, connection: &Arc<ConnectionInner>) {
        let Some(topics) = connection.shut_down() else {
            return;
        };
        if !topics.is_empty() {
            let mut tree = self.tree.write();
            for topic in &topics {
                tree.invalidate_topic(connection.node, topic);
            }
        }
        BusMetrics::incr(&self.metrics.connections_disconnected);
        debug!(
            node = %connection.node,
            connection = %connection.id,
            topics = topics.len(),
            "Disconnected"
        );
        self.note_inert(1);
    }

    fn note_inert(&self, count: usize) {
        let threshold = self.config.effective_threshold();
        let total = self.inert_connections.fetch_add(count, Ordering::AcqRel) + count;
        if total < threshold {
            return;
        }
        // Only the thread that resets the counter schedules.
        if self
            .inert_connections
            .compare_exchange(total, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            && self.config.background_compaction
        {
            let started = self.compaction.schedule();
            debug!(inert = total, started, "Compaction requested");
        }
    }

    /// Resolves and registers a message for a publish of `topic` from `origin`.
    fn prepare(
        &self,
        origin: NodeId,
        topic: &Arc<TopicMeta>,
    ) -> Result<Arc<MessageState>, BusError> {
        let tree = self.tree.read();
        if !tree.contains(origin) {
            drop(tree);
            warn!(node = %origin, topic = %topic.name, "Publish on disposed bus node");
            return Err(BusError::NodeDisposed { node: origin });
        }
        let handlers = tree.resolve(origin, topic);
        let message = Arc::new(MessageState::new(Arc::clone(topic), handlers));
        tree.track(&message);
        BusMetrics::incr(&self.metrics.messages_published);
        Ok(message)
    }

    fn deliver(
        &self,
        message: &Arc<MessageState>,
        invoke: &Invoker<'_>,
        failures: &mut Vec<HandlerFailure>,
    ) {
        message.deliver(invoke, &self.metrics, self.config.log_handler_failures, failures);
        self.tree.read().untrack(message);
    }

    fn publish(
        &self,
        origin: NodeId,
        topic: &Arc<TopicMeta>,
        invoke: &Invoker<'_>,
    ) -> Result<(), BusError> {
        let message = self.prepare(origin, topic)?;
        let outermost = !dispatch::is_dispatching(self.tree_id);
        let _guard = DispatchGuard::enter(self.tree_id);

        let mut failures = Vec::new();
        self.deliver(&message, invoke, &mut failures);

        if outermost {
            while let Some(queued) = dispatch::dequeue(self.tree_id) {
                self.deliver(&queued.state, queued.invoke.as_ref(), &mut failures);
            }
        }

        match DeliveryError::from_failures(failures) {
            Some(error) => Err(BusError::Delivery(error)),
            None => Ok(()),
        }
    }

    fn post(
        &self,
        origin: NodeId,
        topic: &Arc<TopicMeta>,
        invoke: Box<Invoker<'static>>,
    ) -> Result<(), BusError> {
        if topic.immediate || !dispatch::is_dispatching(self.tree_id) {
            return self.publish(origin, topic, invoke.as_ref());
        }
        let state = self.prepare(origin, topic)?;
        BusMetrics::incr(&self.metrics.messages_queued);
        debug!(node = %origin, topic = %topic.name, handlers = state.handler_count(), "Post queued behind dispatch");
        dispatch::enqueue(self.tree_id, QueuedMessage { state, invoke });
        Ok(())
    }

    fn has_undelivered(&self, origin: NodeId, topic: &TopicMeta) -> bool {
        self.tree.read().has_undelivered(origin, topic)
    }

    fn add_child(&self, parent: NodeId) -> Result<NodeId, BusError> {
        let child = self.tree.write().add_child(parent);
        match child {
            Some(child) => {
                BusMetrics::incr(&self.metrics.nodes_created);
                debug!(parent = %parent, node = %child, "Child bus created");
                Ok(child)
            }
            None => {
                warn!(node = %parent, "Create child on disposed bus node");
                Err(BusError::NodeDisposed { node: parent })
            }
        }
    }

    /// Removes `node` with its subtree. Returns `false` if it was already gone.
    fn dispose_subtree(&self, node: NodeId) -> bool {
        let Some(removed) = self.tree.write().remove_subtree(node) else {
            return false;
        };

        let mut disconnected = 0;
        for connection in &removed.connections {
            if connection.shut_down().is_some() {
                disconnected += 1;
            }
        }
        for owner in removed.owners {
            owner.release();
        }

        BusMetrics::add(&self.metrics.nodes_disposed, removed.nodes.len());
        BusMetrics::add(&self.metrics.connections_disconnected, disconnected);
        debug!(
            node = %node,
            nodes = removed.nodes.len(),
            connections = disconnected,
            "Bus node disposed"
        );
        true
    }

    fn compact(&self) -> usize {
        let removed = self.tree.write().compact();
        BusMetrics::incr(&self.metrics.compaction_passes);
        BusMetrics::add(&self.metrics.records_compacted, removed);
        debug!(removed, "Compaction pass finished");
        removed
    }

    fn unload(&self, predicate: &dyn Fn(&PluginId) -> bool) -> usize {
        // The predicate is caller code and may use the bus.
        let candidates = self.tree.read().plugin_groups();
        let matched: BTreeSet<PluginId> = candidates.into_iter().filter(|g| predicate(g)).collect();
        if matched.is_empty() {
            return 0;
        }
        let (unloaded, emptied) = self.tree.write().unload_groups(&matched);
        for connection in &emptied {
            self.disconnect(connection);
        }
        BusMetrics::add(&self.metrics.plugin_subscriptions_removed, unloaded.len());
        info!(
            subscriptions = unloaded.len(),
            connections = emptied.len(),
            "Plugin subscriptions removed"
        );
        unloaded.len()
    }
}

/// Handle on one node of a bus tree.
///
/// Cheap to clone; clones address the same node. A handle outlives its node:
/// once the node is disposed, operations fail with [`BusError::NodeDisposed`].
#[derive(Clone)]
pub struct MessageBus {
    shared: Arc<BusShared>,
    node: NodeId,
}

impl MessageBus {
    fn handle(&self, node: NodeId) -> MessageBus {
        MessageBus {
            shared: Arc::clone(&self.shared),
            node,
        }
    }

    fn connection(&self, inner: Arc<ConnectionInner>) -> MessageBusConnection {
        MessageBusConnection {
            inner,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Node identity.
    pub fn id(&self) -> NodeId {
        self.node
    }

    /// Whether this handle addresses the tree root.
    pub fn is_root(&self) -> bool {
        self.shared.root() == self.node
    }

    /// Opens a connection that lives until disconnected or the node is disposed.
    ///
    /// # Errors
    ///
    /// [`BusError::NodeDisposed`] if the node is gone.
    pub fn connect(&self) -> Result<MessageBusConnection, BusError> {
        self.shared.connect(self.node, None).map(|inner| self.connection(inner))
    }

    /// Opens a connection whose subscriptions default to `group`.
    ///
    /// # Errors
    ///
    /// [`BusError::NodeDisposed`] if the node is gone.
    pub fn connect_in_group(&self, group: impl Into<PluginId>) -> Result<MessageBusConnection, BusError> {
        self.shared
            .connect(self.node, Some(group.into()))
            .map(|inner| self.connection(inner))
    }

    /// Opens a connection disconnected exactly once when `scope` is disposed.
    ///
    /// # Errors
    ///
    /// - [`BusError::ScopeDisposed`] if `scope` is already disposed.
    /// - [`BusError::NodeDisposed`] if the node is gone.
    pub fn connect_with<S>(&self, scope: &S) -> Result<MessageBusConnection, BusError>
    where
        S: DisposalScope + Clone + 'static,
    {
        if scope.is_disposed() {
            return Err(BusError::ScopeDisposed {
                scope: scope.name().to_string(),
            });
        }
        let connection = self.connect()?;

        let inner = Arc::downgrade(&connection.inner);
        let shared = Arc::downgrade(&connection.shared);
        let hook = Box::new(move || {
            if let (Some(inner), Some(shared)) = (inner.upgrade(), shared.upgrade()) {
                shared.disconnect(&inner);
            }
        });

        let Some(binding) = ScopeBinding::register(scope, hook) else {
            connection.disconnect();
            return Err(BusError::ScopeDisposed {
                scope: scope.name().to_string(),
            });
        };

        // A disconnect racing with registration takes the slot after setting
        // the flag, so the flag is checked under the slot lock.
        let unclaimed = {
            let mut slot = connection.inner.scope.lock();
            if connection.inner.is_disconnected() {
                Some(binding)
            } else {
                *slot = Some(binding);
                None
            }
        };
        if let Some(binding) = unclaimed {
            binding.release();
        }
        Ok(connection)
    }

    /// Publisher for `topic` bound to this node.
    pub fn sync_publisher<L>(&self, topic: &Topic<L>) -> Publisher<L>
    where
        L: ?Sized + Send + Sync + 'static,
    {
        Publisher {
            shared: Arc::clone(&self.shared),
            node: self.node,
            topic: topic.clone(),
        }
    }

    /// Whether a publish of `topic` is in progress (or queued) with a live
    /// handler not yet reached on a node this node's publishes would reach.
    pub fn has_undelivered_events<L: ?Sized>(&self, topic: &Topic<L>) -> bool {
        self.shared.has_undelivered(self.node, topic.meta())
    }

    /// Creates a child node disposed together with `owner`.
    ///
    /// # Errors
    ///
    /// - [`BusError::ScopeDisposed`] if `owner` is already disposed.
    /// - [`BusError::NodeDisposed`] if this node is gone.
    pub fn create_child<S>(&self, owner: &S) -> Result<MessageBus, BusError>
    where
        S: DisposalScope + Clone + 'static,
    {
        if owner.is_disposed() {
            return Err(BusError::ScopeDisposed {
                scope: owner.name().to_string(),
            });
        }
        let child = self.create_child_unowned()?;

        let shared = Arc::downgrade(&self.shared);
        let node = child.node;
        let hook = Box::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.dispose_subtree(node);
            }
        });

        let Some(binding) = ScopeBinding::register(owner, hook) else {
            child.dispose();
            return Err(BusError::ScopeDisposed {
                scope: owner.name().to_string(),
            });
        };

        let unclaimed = {
            let mut tree = self.shared.tree.write();
            match tree.node_mut(node) {
                Some(entry) => {
                    entry.owner = Some(binding);
                    None
                }
                None => Some(binding),
            }
        };
        if let Some(binding) = unclaimed {
            binding.release();
        }
        debug!(parent = %self.node, node = %node, owner = owner.name(), "Child bus bound to owner");
        Ok(child)
    }

    /// Creates a child node that lives until [`Self::dispose`] or until this
    /// node is disposed.
    ///
    /// # Errors
    ///
    /// [`BusError::NodeDisposed`] if this node is gone.
    pub fn create_child_unowned(&self) -> Result<MessageBus, BusError> {
        self.shared.add_child(self.node).map(|child| self.handle(child))
    }

    /// Disposes this node and its subtree, disconnecting every connection on
    /// them. Idempotent.
    pub fn dispose(&self) {
        self.shared.dispose_subtree(self.node);
    }

    pub fn is_disposed(&self) -> bool {
        !self.shared.tree.read().contains(self.node)
    }

    /// Parent node, `None` for the root or a disposed node.
    pub fn parent(&self) -> Option<MessageBus> {
        let parent = self.shared.tree.read().parent(self.node);
        parent.map(|p| self.handle(p))
    }

    /// Live children in creation order.
    pub fn children(&self) -> Vec<MessageBus> {
        let children = self.shared.tree.read().children(self.node);
        children.into_iter().map(|c| self.handle(c)).collect()
    }

    /// Counters for the whole tree.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("tree", &self.shared.tree_id)
            .field("node", &self.node)
            .finish()
    }
}

/// Fans a call out to every handler of one topic, as seen from one node.
pub struct Publisher<L: ?Sized> {
    shared: Arc<BusShared>,
    node: NodeId,
    topic: Topic<L>,
}

fn type_mismatch(topic: &str) -> HandlerError {
    HandlerError::failed(format!("listener type mismatch on topic {topic}"))
}

impl<L> Publisher<L>
where
    L: ?Sized + Send + Sync + 'static,
{
    pub fn topic(&self) -> &Topic<L> {
        &self.topic
    }

    /// Invokes `call` on every resolved handler, in delivery order.
    ///
    /// Handler panics are caught; every handler is attempted.
    ///
    /// # Errors
    ///
    /// - [`BusError::Delivery`] if any handler panicked.
    /// - [`BusError::NodeDisposed`] if the publishing node is gone.
    pub fn publish<F>(&self, call: F) -> Result<(), BusError>
    where
        F: Fn(&L),
    {
        self.try_publish(|listener| {
            call(listener);
            Ok(())
        })
    }

    /// Like [`Self::publish`] for calls that report their own failure.
    ///
    /// # Errors
    ///
    /// - [`BusError::Delivery`] aggregating every `Err` and panic.
    /// - [`BusError::NodeDisposed`] if the publishing node is gone.
    pub fn try_publish<F>(&self, call: F) -> Result<(), BusError>
    where
        F: Fn(&L) -> Result<(), HandlerError>,
    {
        let invoke = |any: &(dyn Any + Send + Sync)| match any.downcast_ref::<Arc<L>>() {
            Some(listener) => call(&**listener),
            None => Err(type_mismatch(self.topic.name())),
        };
        self.shared.publish(self.node, self.topic.meta(), &invoke)
    }

    /// Publishes now, or, for a non-immediate topic while this thread is
    /// already dispatching on the tree, after the outermost publish finishes.
    ///
    /// Failures of a queued post are reported by the outermost publish.
    ///
    /// # Errors
    ///
    /// Same as [`Self::publish`] when delivered at once;
    /// [`BusError::NodeDisposed`] when queued on a disposed node.
    pub fn post<F>(&self, call: F) -> Result<(), BusError>
    where
        F: Fn(&L) + 'static,
    {
        let name = self.topic.name().to_string();
        let invoke: Box<Invoker<'static>> =
            Box::new(move |any: &(dyn Any + Send + Sync)| match any.downcast_ref::<Arc<L>>() {
                Some(listener) => {
                    call(&**listener);
                    Ok(())
                }
                None => Err(type_mismatch(&name)),
            });
        self.shared.post(self.node, self.topic.meta(), invoke)
    }
}

impl<L: ?Sized> Clone for Publisher<L> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            node: self.node,
            topic: self.topic.clone(),
        }
    }
}

impl<L: ?Sized> fmt::Debug for Publisher<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("node", &self.node)
            .field("topic", &self.topic.name())
            .finish()
    }
}

/// Root of a bus tree. Dereferences to the root [`MessageBus`].
pub struct RootBus {
    bus: MessageBus,
}

impl RootBus {
    /// Root with default configuration and a dedicated compaction thread.
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(config: BusConfig) -> Self {
        let executor = Arc::new(ThreadExecutor::new(config.compaction_thread_name.clone()));
        Self::with_executor(config, executor)
    }

    /// Root whose compaction passes run on `executor`.
    pub fn with_executor(config: BusConfig, executor: Arc<dyn CompactionExecutor>) -> Self {
        let shared = BusShared::new(config, executor);
        let node = shared.root();
        info!(
            tree = shared.tree_id,
            node = %node,
            compaction_threshold = shared.config.effective_threshold(),
            "Root bus created"
        );
        Self {
            bus: MessageBus { shared, node },
        }
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn config(&self) -> &BusConfig {
        &self.bus.shared.config
    }

    /// Removes every subscription whose group matches `predicate`, anywhere
    /// in the tree. Connections left without subscriptions are disconnected.
    ///
    /// Returns the number of subscriptions removed.
    pub fn disconnect_plugin_connections<P>(&self, predicate: P) -> usize
    where
        P: Fn(&PluginId) -> bool,
    {
        self.bus.shared.unload(&predicate)
    }

    /// Runs a compaction pass on the calling thread.
    ///
    /// Returns the number of connection records removed.
    pub fn compact_now(&self) -> usize {
        self.bus.shared.compact()
    }

    /// Requests a background pass. `false` if folded into a running one.
    pub fn schedule_compaction(&self) -> bool {
        self.bus.shared.compaction.schedule()
    }

    /// Background passes completed.
    pub fn compaction_passes(&self) -> u64 {
        self.bus.shared.compaction.passes()
    }

    /// Whether a background pass is running or queued.
    pub fn is_compacting(&self) -> bool {
        self.bus.shared.compaction.is_busy()
    }

    /// Connection records held by the tree, inert ones included.
    pub fn connection_records(&self) -> usize {
        self.bus.shared.tree.read().connection_records()
    }

    /// Live nodes in the tree, root included.
    pub fn node_count(&self) -> usize {
        self.bus.shared.tree.read().len()
    }
}

impl Default for RootBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for RootBus {
    type Target = MessageBus;

    fn deref(&self) -> &MessageBus {
        &self.bus
    }
}

impl fmt::Debug for RootBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootBus")
            .field("tree", &self.bus.shared.tree_id)
            .field("root", &self.bus.node)
            .finish()
    }
}
