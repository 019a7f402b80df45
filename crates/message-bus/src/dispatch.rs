//! # Dispatch core
//!
//! Every publish becomes a [`MessageState`]: the handler snapshot resolved
//! for the publishing node plus a cursor. The publishing thread drains it
//! iteratively:
//!
//! ```text
//! cursor ──► [h0][h1][h2][h3]
//!             │
//!             ├─ advance cursor, then invoke (so a nested query sees h0 as visited)
//!             ├─ skip if the connection or subscription went inert
//!             └─ catch Err / panic, record, continue
//! ```
//!
//! A handler that publishes again starts a new message, drained to the end
//! before it returns; the outer message then resumes at its cursor. Nothing
//! is delivered twice and nothing reached later is skipped.
//!
//! Posts on non-immediate topics made while the thread is already
//! dispatching on the same tree go to a per-thread FIFO. The outermost
//! dispatch drains that FIFO before returning and folds its failures into its
//! own result.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::connection::{ConnectionInner, Subscription};
use crate::error::{HandlerError, HandlerFailure};
use crate::metrics::BusMetrics;
use crate::topic::TopicMeta;
use crate::tree::NodeId;

/// Type-erased call of one listener.
pub(crate) type Invoker<'a> = dyn Fn(&(dyn Any + Send + Sync)) -> Result<(), HandlerError> + 'a;

/// One resolved subscriber in a snapshot.
pub(crate) struct Handler {
    pub(crate) node: NodeId,
    pub(crate) connection: Arc<ConnectionInner>,
    pub(crate) subscription: Arc<Subscription>,
}

impl Handler {
    pub(crate) fn is_live(&self) -> bool {
        !self.connection.is_disconnected() && self.subscription.is_active()
    }
}

/// A message being delivered or waiting in a queue.
pub(crate) struct MessageState {
    topic: Arc<TopicMeta>,
    handlers: Arc<[Handler]>,
    cursor: AtomicUsize,
}

impl MessageState {
    pub(crate) fn new(topic: Arc<TopicMeta>, handlers: Arc<[Handler]>) -> Self {
        Self {
            topic,
            handlers,
            cursor: AtomicUsize::new(0),
        }
    }

    pub(crate) fn topic(&self) -> &TopicMeta {
        &self.topic
    }

    pub(crate) fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Distinct nodes owning a handler, in first-seen order.
    pub(crate) fn nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = Vec::new();
        for handler in self.handlers.iter() {
            if !nodes.contains(&handler.node) {
                nodes.push(handler.node);
            }
        }
        nodes
    }

    /// True if a live handler on `node` has not been reached yet.
    pub(crate) fn has_unvisited_on(&self, node: NodeId) -> bool {
        let from = self.cursor.load(Ordering::Acquire);
        self.handlers
            .get(from..)
            .is_some_and(|rest| rest.iter().any(|h| h.node == node && h.is_live()))
    }

    /// Invokes every remaining live handler, recording failures.
    pub(crate) fn deliver(
        &self,
        invoke: &Invoker<'_>,
        metrics: &BusMetrics,
        log_failures: bool,
        failures: &mut Vec<HandlerFailure>,
    ) {
        loop {
            let index = self.cursor.load(Ordering::Acquire);
            let Some(handler) = self.handlers.get(index) else {
                break;
            };
            self.cursor.store(index + 1, Ordering::Release);

            if !handler.is_live() {
                BusMetrics::incr(&metrics.skipped_inert);
                continue;
            }

            BusMetrics::incr(&metrics.deliveries);
            let listener = handler.subscription.listener.as_ref();
            let result = match catch_unwind(AssertUnwindSafe(|| invoke(listener))) {
                Ok(result) => result,
                Err(payload) => Err(HandlerError::from_panic(payload)),
            };

            if let Err(error) = result {
                BusMetrics::incr(&metrics.handler_failures);
                if error.is_cancellation() {
                    BusMetrics::incr(&metrics.cancellations);
                    debug!(
                        topic = %self.topic.name,
                        node = %handler.node,
                        connection = %handler.connection.id,
                        error = %error,
                        "Handler cancelled"
                    );
                } else if log_failures {
                    warn!(
                        topic = %self.topic.name,
                        node = %handler.node,
                        connection = %handler.connection.id,
                        error = %error,
                        "Handler failed; continuing fan-out"
                    );
                }
                failures.push(HandlerFailure {
                    topic: self.topic.name.clone(),
                    node: handler.node,
                    connection: handler.connection.id,
                    error,
                });
            }
        }
    }
}

/// A post waiting for the outermost dispatch on its thread to finish.
pub(crate) struct QueuedMessage {
    pub(crate) state: Arc<MessageState>,
    pub(crate) invoke: Box<Invoker<'static>>,
}

#[derive(Default)]
struct DispatchFrame {
    depth: usize,
    queue: VecDeque<QueuedMessage>,
}

thread_local! {
    static FRAMES: RefCell<HashMap<u64, DispatchFrame>> = RefCell::new(HashMap::new());
}

/// Marks the current thread as dispatching on tree `tree` until dropped.
pub(crate) struct DispatchGuard {
    tree: u64,
}

impl DispatchGuard {
    pub(crate) fn enter(tree: u64) -> Self {
        FRAMES.with(|frames| {
            frames.borrow_mut().entry(tree).or_default().depth += 1;
        });
        Self { tree }
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            if let Some(frame) = frames.get_mut(&self.tree) {
                frame.depth = frame.depth.saturating_sub(1);
                if frame.depth == 0 && frame.queue.is_empty() {
                    frames.remove(&self.tree);
                }
            }
        });
    }
}

/// Whether the current thread is inside a dispatch on `tree`.
pub(crate) fn is_dispatching(tree: u64) -> bool {
    FRAMES.with(|frames| frames.borrow().get(&tree).is_some_and(|f| f.depth > 0))
}

/// Appends a post to the current thread's queue for `tree`.
pub(crate) fn enqueue(tree: u64, message: QueuedMessage) {
    FRAMES.with(|frames| {
        frames
            .borrow_mut()
            .entry(tree)
            .or_default()
            .queue
            .push_back(message);
    });
}

/// Pops the next queued post for `tree`, if any.
pub(crate) fn dequeue(tree: u64) -> Option<QueuedMessage> {
    FRAMES.with(|frames| {
        let mut frames = frames.borrow_mut();
        let frame = frames.get_mut(&tree)?;
        let next = frame.queue.pop_front();
        if frame.depth == 0 && frame.queue.is_empty() {
            frames.remove(&tree);
        }
        next
    })
}
