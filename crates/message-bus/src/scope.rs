//! # Disposal scopes
//!
//! The bus never owns a lifecycle registry of its own. Anything that can
//! register a dispose hook and later withdraw it implements [`DisposalScope`]
//! and can own connections ([`MessageBus::connect_with`]) and child nodes
//! ([`MessageBus::create_child`]).
//!
//! [`Scope`] is the in-crate implementation: hooks run once, in reverse
//! registration order, outside the scope's lock.
//!
//! [`MessageBus::connect_with`]: crate::MessageBus::connect_with
//! [`MessageBus::create_child`]: crate::MessageBus::create_child

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

/// Handle for a registered dispose hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

impl HookId {
    /// Wraps a raw id; for [`DisposalScope`] implementations outside this crate.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Callback run when a scope is disposed.
pub type DisposeHook = Box<dyn FnOnce() + Send + 'static>;

/// A lifecycle owner the bus can attach to.
pub trait DisposalScope: Send + Sync {
    /// Diagnostic name.
    fn name(&self) -> &str;

    /// Whether the scope has been disposed.
    fn is_disposed(&self) -> bool;

    /// Registers `hook` to run exactly once on disposal.
    ///
    /// Returns `None` if the scope is already disposed; the hook is then
    /// dropped without running.
    fn on_dispose(&self, hook: DisposeHook) -> Option<HookId>;

    /// Withdraws a hook. Unknown or already-run ids are ignored.
    fn remove_hook(&self, id: HookId);
}

/// A scope registration held by a bus object so it can withdraw its hook
/// when it goes away first.
pub(crate) struct ScopeBinding {
    scope: Box<dyn DisposalScope>,
    hook: HookId,
}

impl ScopeBinding {
    /// Registers `hook` on `scope`; `None` when the scope is already disposed.
    pub(crate) fn register<S>(scope: &S, hook: DisposeHook) -> Option<Self>
    where
        S: DisposalScope + Clone + 'static,
    {
        let id = scope.on_dispose(hook)?;
        Some(Self {
            scope: Box::new(scope.clone()),
            hook: id,
        })
    }

    pub(crate) fn release(self) {
        self.scope.remove_hook(self.hook);
    }
}

impl fmt::Debug for ScopeBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeBinding")
            .field("scope", &self.scope.name())
            .field("hook", &self.hook)
            .finish()
    }
}

struct ScopeInner {
    name: String,
    disposed: AtomicBool,
    next_hook: AtomicU64,
    hooks: Mutex<Vec<(HookId, DisposeHook)>>,
    /// Hook this scope holds on its parent, withdrawn on disposal.
    parent: Mutex<Option<(Weak<ScopeInner>, HookId)>>,
}

/// Reference-counted disposal scope.
///
/// Clones share state. Dropping every clone does *not* dispose the scope;
/// call [`Scope::dispose`].
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    /// Creates a live scope.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                name: name.into(),
                disposed: AtomicBool::new(false),
                next_hook: AtomicU64::new(1),
                hooks: Mutex::new(Vec::new()),
                parent: Mutex::new(None),
            }),
        }
    }

    /// Creates a scope disposed together with `self`.
    ///
    /// If `self` is already disposed the child is returned disposed.
    pub fn child(&self, name: impl Into<String>) -> Scope {
        let child = Scope::new(name);
        let weak: Weak<ScopeInner> = Arc::downgrade(&child.inner);
        let registered = self.on_dispose(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                Scope { inner }.dispose();
            }
        }));
        match registered {
            Some(id) => {
                *child.inner.parent.lock() = Some((Arc::downgrade(&self.inner), id));
                if child.is_disposed() {
                    self.remove_hook(id);
                }
            }
            None => child.dispose(),
        }
        child
    }

    /// Runs every registered hook once, newest first. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let parent = self.inner.parent.lock().take();
        if let Some((parent, id)) = parent {
            if let Some(inner) = parent.upgrade() {
                Scope { inner }.remove_hook(id);
            }
        }
        let hooks = std::mem::take(&mut *self.inner.hooks.lock());
        debug!(scope = %self.inner.name, hooks = hooks.len(), "Disposing scope");
        for (_, hook) in hooks.into_iter().rev() {
            hook();
        }
    }

    /// Number of hooks still waiting to run.
    pub fn hook_count(&self) -> usize {
        self.inner.hooks.lock().len()
    }
}

impl DisposalScope for Scope {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    fn on_dispose(&self, hook: DisposeHook) -> Option<HookId> {
        let mut hooks = self.inner.hooks.lock();
        if self.is_disposed() {
            return None;
        }
        let id = HookId(self.inner.next_hook.fetch_add(1, Ordering::Relaxed));
        hooks.push((id, hook));
        Some(id)
    }

    fn remove_hook(&self, id: HookId) {
        self.inner.hooks.lock().retain(|(hook, _)| *hook != id);
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("name", &self.inner.name)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
