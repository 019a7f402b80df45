//! # Bus tree arena
//!
//! All nodes of one bus tree live in a single arena keyed by [`NodeId`].
//! Parent/child links are ids, so no node owns another and removal never
//! chases back-pointers.
//!
//! The arena sits behind the root's `RwLock`:
//!
//! - structural changes (add/remove node, add connection, invalidation,
//!   compaction) take the write lock,
//! - publish takes the read lock to fetch or build its handler snapshot and
//!   releases it before any handler runs.
//!
//! Each node caches the resolved handler list per topic. A cache entry is
//! built under the read lock and cleared under the write lock, so a publish
//! that starts after an invalidation can never read the stale list.
//!
//! ## Delivery order
//!
//! ```text
//! ToChildren        ancestors (root → parent), node, subtree pre-order
//! ToParent          node, parent, …, root
//! ToDirectChildren  node, direct children
//! None              node
//! ```
//!
//! Within a node: connections in connect order, then subscriptions in
//! subscribe order.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::{ConnectionInner, PluginId};
use crate::dispatch::{Handler, MessageState};
use crate::scope::ScopeBinding;
use crate::topic::{BroadcastDirection, TopicId, TopicMeta};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a bus node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    fn next() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

pub(crate) struct NodeEntry {
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) connections: Vec<Arc<ConnectionInner>>,
    cache: Mutex<HashMap<TopicId, Arc<[Handler]>>>,
    pending: Mutex<HashMap<TopicId, Vec<Arc<MessageState>>>>,
    pub(crate) owner: Option<ScopeBinding>,
}

impl NodeEntry {
    fn new(parent: Option<NodeId>) -> Self {
        Self {
            parent,
            children: Vec::new(),
            connections: Vec::new(),
            cache: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            owner: None,
        }
    }
}

/// What [`Tree::remove_subtree`] detached.
pub(crate) struct Removed {
    pub(crate) nodes: Vec<NodeId>,
    pub(crate) connections: Vec<Arc<ConnectionInner>>,
    pub(crate) owners: Vec<ScopeBinding>,
}

/// One subscription removed by plugin unload.
pub(crate) struct Unloaded {
    pub(crate) node: NodeId,
    pub(crate) topic: Arc<TopicMeta>,
}

pub(crate) struct Tree {
    root: NodeId,
    nodes: HashMap<NodeId, NodeEntry>,
}

impl Tree {
    pub(crate) fn new() -> Self {
        let root = NodeId::next();
        let mut nodes = HashMap::new();
        nodes.insert(root, NodeEntry::new(None));
        Self { root, nodes }
    }

    pub(crate) fn root(&self) -> NodeId {
        self.root
    }

    pub(crate) fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    pub(crate) fn node_mut(&mut self, node: NodeId) -> Option<&mut NodeEntry> {
        self.nodes.get_mut(&node)
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(&node).and_then(|e| e.parent)
    }

    pub(crate) fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(&node)
            .map(|e| e.children.clone())
            .unwrap_or_default()
    }

    /// Appends a child under `parent`. Returns `None` if `parent` is gone.
    pub(crate) fn add_child(&mut self, parent: NodeId) -> Option<NodeId> {
        if !self.contains(parent) {
            return None;
        }
        let child = NodeId::next();
        self.nodes.insert(child, NodeEntry::new(Some(parent)));
        if let Some(entry) = self.nodes.get_mut(&parent) {
            entry.children.push(child);
        }
        self.invalidate_all(self.ancestors_inclusive(parent));
        Some(child)
    }

    /// Detaches `node` and its whole subtree. `None` if already gone.
    pub(crate) fn remove_subtree(&mut self, node: NodeId) -> Option<Removed> {
        if !self.contains(node) {
            return None;
        }
        let doomed = self.subtree(node);
        if let Some(parent) = self.parent(node) {
            if let Some(entry) = self.nodes.get_mut(&parent) {
                entry.children.retain(|c| *c != node);
            }
            self.invalidate_all(self.ancestors_inclusive(parent));
        }

        let mut removed = Removed {
            nodes: Vec::with_capacity(doomed.len()),
            connections: Vec::new(),
            owners: Vec::new(),
        };
        for id in doomed {
            if let Some(entry) = self.nodes.remove(&id) {
                removed.nodes.push(id);
                removed.connections.extend(entry.connections);
                removed.owners.extend(entry.owner);
            }
        }
        Some(removed)
    }

    /// `node` followed by its ancestors up to the root.
    pub(crate) fn ancestors_inclusive(&self, node: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut cursor = Some(node);
        while let Some(id) = cursor {
            if !self.contains(id) {
                break;
            }
            chain.push(id);
            cursor = self.parent(id);
        }
        chain
    }

    /// `node` and its descendants, pre-order in child registration order.
    pub(crate) fn subtree(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            let Some(entry) = self.nodes.get(&id) else {
                continue;
            };
            out.push(id);
            stack.extend(entry.children.iter().rev().copied());
        }
        out
    }

    /// Nodes a publish from `origin` visits, in delivery order.
    pub(crate) fn reach(&self, origin: NodeId, direction: BroadcastDirection) -> Vec<NodeId> {
        if !self.contains(origin) {
            return Vec::new();
        }
        match direction {
            BroadcastDirection::ToChildren => {
                let mut order = self.ancestors_inclusive(origin);
                order.reverse();
                order.pop();
                order.extend(self.subtree(origin));
                order
            }
            BroadcastDirection::ToParent => self.ancestors_inclusive(origin),
            BroadcastDirection::ToDirectChildren => {
                let mut order = vec![origin];
                order.extend(self.children(origin));
                order
            }
            BroadcastDirection::None => vec![origin],
        }
    }

    /// Publishers whose reach includes `node` for `direction`.
    fn publishers_reaching(&self, node: NodeId, direction: BroadcastDirection) -> Vec<NodeId> {
        match direction {
            BroadcastDirection::ToChildren => {
                let mut out = self.ancestors_inclusive(node);
                out.extend(self.subtree(node).into_iter().skip(1));
                out
            }
            BroadcastDirection::ToParent => self.subtree(node),
            BroadcastDirection::ToDirectChildren => {
                let mut out = vec![node];
                out.extend(self.parent(node));
                out
            }
            BroadcastDirection::None => vec![node],
        }
    }

    /// Resolved handler snapshot for a publish of `topic` from `origin`.
    pub(crate) fn resolve(&self, origin: NodeId, topic: &TopicMeta) -> Arc<[Handler]> {
        let Some(entry) = self.nodes.get(&origin) else {
            return Arc::from(Vec::new());
        };
        if let Some(cached) = entry.cache.lock().get(&topic.id) {
            return Arc::clone(cached);
        }

        let mut handlers = Vec::new();
        for node in self.reach(origin, topic.direction) {
            let Some(target) = self.nodes.get(&node) else {
                continue;
            };
            for connection in &target.connections {
                for subscription in connection.live_subscriptions(topic.id) {
                    handlers.push(Handler {
                        node,
                        connection: Arc::clone(connection),
                        subscription,
                    });
                }
            }
        }
        let handlers: Arc<[Handler]> = Arc::from(handlers);
        entry
            .cache
            .lock()
            .insert(topic.id, Arc::clone(&handlers));
        handlers
    }

    /// Drops cached lists for `topic` on every node whose publishes reach `node`.
    pub(crate) fn invalidate_topic(&mut self, node: NodeId, topic: &TopicMeta) {
        for id in self.publishers_reaching(node, topic.direction) {
            if let Some(entry) = self.nodes.get_mut(&id) {
                entry.cache.get_mut().remove(&topic.id);
            }
        }
    }

    fn invalidate_all(&mut self, nodes: Vec<NodeId>) {
        for id in nodes {
            if let Some(entry) = self.nodes.get_mut(&id) {
                entry.cache.get_mut().clear();
            }
        }
    }

    /// Number of topics cached on `node`.
    #[cfg(test)]
    pub(crate) fn cached_topics(&self, node: NodeId) -> usize {
        self.nodes
            .get(&node)
            .map(|e| e.cache.lock().len())
            .unwrap_or(0)
    }

    /// Registers an in-flight or queued message on every node owning one of
    /// its handlers.
    pub(crate) fn track(&self, message: &Arc<MessageState>) {
        for node in message.nodes() {
            if let Some(entry) = self.nodes.get(&node) {
                entry
                    .pending
                    .lock()
                    .entry(message.topic().id)
                    .or_default()
                    .push(Arc::clone(message));
            }
        }
    }

    /// Reverses [`Self::track`]. Nodes disposed meanwhile are skipped.
    pub(crate) fn untrack(&self, message: &Arc<MessageState>) {
        let topic = message.topic().id;
        for node in message.nodes() {
            let Some(entry) = self.nodes.get(&node) else {
                continue;
            };
            let mut pending = entry.pending.lock();
            if let Some(list) = pending.get_mut(&topic) {
                list.retain(|m| !Arc::ptr_eq(m, message));
                if list.is_empty() {
                    pending.remove(&topic);
                }
            }
        }
    }

    /// Whether a tracked message of `topic` still has an unvisited live
    /// handler on a node reachable from `origin`.
    pub(crate) fn has_undelivered(&self, origin: NodeId, topic: &TopicMeta) -> bool {
        self.reach(origin, topic.direction).into_iter().any(|node| {
            self.nodes.get(&node).is_some_and(|entry| {
                entry
                    .pending
                    .lock()
                    .get(&topic.id)
                    .is_some_and(|list| list.iter().any(|m| m.has_unvisited_on(node)))
            })
        })
    }

    /// Distinct groups of the live subscriptions in the tree.
    pub(crate) fn plugin_groups(&self) -> BTreeSet<PluginId> {
        let mut groups = BTreeSet::new();
        for entry in self.nodes.values() {
            for connection in &entry.connections {
                if connection.is_disconnected() {
                    continue;
                }
                for sub in connection.subscriptions.lock().iter() {
                    if let Some(group) = sub.group.as_ref().filter(|_| sub.is_active()) {
                        groups.insert(group.clone());
                    }
                }
            }
        }
        groups
    }

    /// Deactivates subscriptions whose group is in `groups`.
    ///
    /// Returns the removed subscriptions and the connections left without
    /// any live subscription.
    pub(crate) fn unload_groups(
        &mut self,
        groups: &BTreeSet<PluginId>,
    ) -> (Vec<Unloaded>, Vec<Arc<ConnectionInner>>) {
        let mut unloaded = Vec::new();
        let mut emptied = Vec::new();

        for (id, entry) in &self.nodes {
            for connection in &entry.connections {
                if connection.is_disconnected() {
                    continue;
                }
                let mut subs = connection.subscriptions.lock();
                let before = unloaded.len();
                for sub in subs.iter() {
                    let matches = sub.group.as_ref().is_some_and(|g| groups.contains(g));
                    if matches && sub.deactivate() {
                        unloaded.push(Unloaded {
                            node: *id,
                            topic: Arc::clone(&sub.topic),
                        });
                    }
                }
                if unloaded.len() > before {
                    subs.retain(|s| s.is_active());
                    if subs.is_empty() {
                        emptied.push(Arc::clone(connection));
                    }
                }
            }
        }

        for removed in &unloaded {
            self.invalidate_topic(removed.node, &removed.topic);
        }
        (unloaded, emptied)
    }

    /// Removes inert connection records and inactive subscriptions.
    ///
    /// Returns the number of connection records removed.
    pub(crate) fn compact(&mut self) -> usize {
        let mut removed = 0;
        for entry in self.nodes.values_mut() {
            let before = entry.connections.len();
            entry.connections.retain(|c| !c.is_disconnected());
            removed += before - entry.connections.len();
            for connection in &entry.connections {
                connection.subscriptions.lock().retain(|s| s.is_active());
            }
        }
        removed
    }

    /// Connection records currently held, inert ones included.
    pub(crate) fn connection_records(&self) -> usize {
        self.nodes.values().map(|e| e.connections.len()).sum()
    }
}
