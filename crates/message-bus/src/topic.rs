//! # Topics
//!
//! A [`Topic`] identifies one pub/sub channel. It fixes three things:
//!
//! - the listener interface `L` subscribers implement (usually a trait object
//!   type such as `dyn FileListener`),
//! - the [`BroadcastDirection`] that decides which bus nodes receive a publish,
//! - whether nested posts are delivered immediately or queued.
//!
//! Topics are compared by identity. Two topics created with the same name are
//! different channels, so applications create each topic once and share it.
//!
//! ```
//! use message_bus::{BroadcastDirection, Topic};
//!
//! trait SettingsListener: Send + Sync {
//!     fn changed(&self, key: &str);
//! }
//!
//! let settings = Topic::<dyn SettingsListener>::new("settings changed");
//! let other = Topic::<dyn SettingsListener>::new("settings changed");
//!
//! assert_eq!(settings.direction(), BroadcastDirection::ToChildren);
//! assert_ne!(settings, other);
//! assert_eq!(settings, settings.clone());
//! ```

use std::any::type_name;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

static NEXT_TOPIC_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique topic identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicId(u64);

impl TopicId {
    fn next() -> Self {
        Self(NEXT_TOPIC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value, useful as a log field.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "topic#{}", self.0)
    }
}

/// Which bus nodes a publish reaches, relative to the publishing node.
///
/// ```text
///                 root            ToParent from `child`:   child, parent, root
///                  │              ToChildren from `parent`: root, parent, child, grandchild
///                parent           ToDirectChildren from `parent`: parent, child
///                  │              None from `parent`:       parent
///                child
///                  │
///             grandchild
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastDirection {
    /// Ancestors (root first), the publishing node, then its whole subtree.
    #[default]
    ToChildren,
    /// The publishing node and its immediate children.
    ToDirectChildren,
    /// The publishing node, then each ancestor up to the root.
    ToParent,
    /// The publishing node only.
    None,
}

impl BroadcastDirection {
    /// Short stable label for logs.
    pub fn as_label(self) -> &'static str {
        match self {
            BroadcastDirection::ToChildren => "to_children",
            BroadcastDirection::ToDirectChildren => "to_direct_children",
            BroadcastDirection::ToParent => "to_parent",
            BroadcastDirection::None => "none",
        }
    }
}

impl fmt::Display for BroadcastDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Type-erased topic attributes shared by every clone of a [`Topic`].
#[derive(Debug)]
pub(crate) struct TopicMeta {
    pub(crate) id: TopicId,
    pub(crate) name: String,
    pub(crate) direction: BroadcastDirection,
    pub(crate) immediate: bool,
    pub(crate) listener_type: &'static str,
}

/// A named, typed channel with a broadcast direction.
///
/// Cloning is cheap and keeps the identity.
pub struct Topic<L: ?Sized> {
    meta: Arc<TopicMeta>,
    _listener: PhantomData<fn(&L)>,
}

impl<L: ?Sized + 'static> Topic<L> {
    /// Creates a [`BroadcastDirection::ToChildren`] topic.
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), BroadcastDirection::ToChildren, false)
    }

    /// Creates a topic with an explicit direction.
    pub fn with_direction(name: impl Into<String>, direction: BroadcastDirection) -> Self {
        Self::build(name.into(), direction, false)
    }

    /// Creates a topic whose posts are never queued behind the message
    /// currently being dispatched on the posting thread.
    pub fn immediate(name: impl Into<String>, direction: BroadcastDirection) -> Self {
        Self::build(name.into(), direction, true)
    }

    fn build(name: String, direction: BroadcastDirection, immediate: bool) -> Self {
        Self {
            meta: Arc::new(TopicMeta {
                id: TopicId::next(),
                name,
                direction,
                immediate,
                listener_type: type_name::<L>(),
            }),
            _listener: PhantomData,
        }
    }
}

impl<L: ?Sized> Topic<L> {
    /// Identity of this topic.
    pub fn id(&self) -> TopicId {
        self.meta.id
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Broadcast direction.
    pub fn direction(&self) -> BroadcastDirection {
        self.meta.direction
    }

    /// Whether posts bypass the per-thread queue.
    pub fn is_immediate(&self) -> bool {
        self.meta.immediate
    }

    /// Type name of the listener interface.
    pub fn listener_type(&self) -> &'static str {
        self.meta.listener_type
    }

    pub(crate) fn meta(&self) -> &Arc<TopicMeta> {
        &self.meta
    }
}

impl<L: ?Sized> Clone for Topic<L> {
    fn clone(&self) -> Self {
        Self {
            meta: Arc::clone(&self.meta),
            _listener: PhantomData,
        }
    }
}

impl<L: ?Sized> PartialEq for Topic<L> {
    fn eq(&self, other: &Self) -> bool {
        self.meta.id == other.meta.id
    }
}

impl<L: ?Sized> Eq for Topic<L> {}

impl<L: ?Sized> Hash for Topic<L> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.meta.id.hash(state);
    }
}

impl<L: ?Sized> fmt::Debug for Topic<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("id", &self.meta.id)
            .field("name", &self.meta.name)
            .field("direction", &self.meta.direction)
            .field("immediate", &self.meta.immediate)
            .field("listener", &self.meta.listener_type)
            .finish()
    }
}

impl<L: ?Sized> fmt::Display for Topic<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.meta.name)
    }
}
