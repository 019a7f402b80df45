//! Error types for the message bus.
//!
//! - [`HandlerError`]: what a single subscriber invocation produced.
//! - [`DeliveryError`]: the aggregate a publisher sees after full fan-out.
//! - [`BusError`]: everything a bus operation can return.

use std::any::Any;
use std::fmt;

use thiserror::Error;

use crate::connection::ConnectionId;
use crate::tree::NodeId;

/// Panic payload that marks a handler as cancelled rather than failed.
///
/// ```
/// use message_bus::{Cancellation, HandlerError};
///
/// let payload: Box<dyn std::any::Any + Send> = Box::new(Cancellation::new("user aborted"));
/// let err = HandlerError::from_panic(payload);
/// assert!(err.is_cancellation());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cancellation {
    reason: String,
}

impl Cancellation {
    /// Creates a cancellation with a reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The reason given at creation.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for Cancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cancelled: {}", self.reason)
    }
}

/// Outcome of one failed handler invocation.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler aborted its unit of work.
    #[error("handler cancelled: {reason}")]
    Cancelled {
        /// Why the work was aborted.
        reason: String,
    },

    /// The handler reported a failure.
    #[error("handler failed: {message}")]
    Failed {
        /// Failure description.
        message: String,
    },

    /// The handler panicked; the payload was caught.
    #[error("handler panicked: {message}")]
    Panicked {
        /// Panic message, when the payload was a string.
        message: String,
    },
}

impl HandlerError {
    /// Builds a [`HandlerError::Cancelled`].
    pub fn cancelled(reason: impl Into<String>) -> Self {
        HandlerError::Cancelled {
            reason: reason.into(),
        }
    }

    /// Builds a [`HandlerError::Failed`].
    pub fn failed(message: impl fmt::Display) -> Self {
        HandlerError::Failed {
            message: message.to_string(),
        }
    }

    /// Maps a caught panic payload. A [`Cancellation`] payload becomes
    /// [`HandlerError::Cancelled`].
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<Cancellation>() {
            Ok(cancel) => return HandlerError::cancelled(cancel.reason),
            Err(other) => other,
        };
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        HandlerError::Panicked { message }
    }

    /// True for [`HandlerError::Cancelled`].
    pub fn is_cancellation(&self) -> bool {
        matches!(self, HandlerError::Cancelled { .. })
    }

    /// Short stable label (snake_case) for logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            HandlerError::Cancelled { .. } => "handler_cancelled",
            HandlerError::Failed { .. } => "handler_failed",
            HandlerError::Panicked { .. } => "handler_panicked",
        }
    }
}

/// One failed invocation together with where it happened.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{error} (topic '{topic}', node {node}, connection {connection})")]
pub struct HandlerFailure {
    /// Name of the delivered topic.
    pub topic: String,
    /// Node owning the failing subscription.
    pub node: NodeId,
    /// Connection owning the failing subscription.
    pub connection: ConnectionId,
    /// What went wrong.
    pub error: HandlerError,
}

/// Aggregate of all handler failures observed by one publish.
///
/// The primary failure is the first cancellation if any handler was cancelled,
/// otherwise the first failure in delivery order. The others are kept as
/// suppressed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("delivery failed: {primary} (+{} suppressed)", .suppressed.len())]
pub struct DeliveryError {
    primary: HandlerFailure,
    suppressed: Vec<HandlerFailure>,
}

impl DeliveryError {
    /// Builds the aggregate, or `None` when there were no failures.
    pub fn from_failures(mut failures: Vec<HandlerFailure>) -> Option<Self> {
        if failures.is_empty() {
            return None;
        }
        let index = failures
            .iter()
            .position(|f| f.error.is_cancellation())
            .unwrap_or(0);
        let primary = failures.remove(index);
        Some(Self {
            primary,
            suppressed: failures,
        })
    }

    /// The failure surfaced to the caller.
    pub fn primary(&self) -> &HandlerFailure {
        &self.primary
    }

    /// Failures recorded after (or besides) the primary one.
    pub fn suppressed(&self) -> &[HandlerFailure] {
        &self.suppressed
    }

    /// All failures, primary first.
    pub fn failures(&self) -> impl Iterator<Item = &HandlerFailure> {
        std::iter::once(&self.primary).chain(self.suppressed.iter())
    }

    /// Total number of failed invocations.
    pub fn len(&self) -> usize {
        1 + self.suppressed.len()
    }

    /// Always false; an aggregate holds at least one failure.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Name of the topic whose delivery produced the primary failure.
    pub fn topic(&self) -> &str {
        &self.primary.topic
    }

    /// True when the primary failure is a cancellation.
    pub fn is_cancellation(&self) -> bool {
        self.primary.error.is_cancellation()
    }
}

/// Errors returned by bus operations.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum BusError {
    /// The node was disposed (directly, via its owner scope, or with an ancestor).
    #[error("message bus node {node} is disposed")]
    NodeDisposed {
        /// The disposed node.
        node: NodeId,
    },

    /// The connection was disconnected before the call.
    #[error("connection {connection} is disconnected")]
    ConnectionDisconnected {
        /// The inert connection.
        connection: ConnectionId,
    },

    /// The disposal scope passed in was already disposed.
    #[error("disposal scope '{scope}' is already disposed")]
    ScopeDisposed {
        /// Diagnostic name of the scope.
        scope: String,
    },

    /// One or more handlers failed during fan-out.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl BusError {
    /// Short stable label (snake_case) for logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            BusError::NodeDisposed { .. } => "bus_node_disposed",
            BusError::ConnectionDisconnected { .. } => "bus_connection_disconnected",
            BusError::ScopeDisposed { .. } => "bus_scope_disposed",
            BusError::Delivery(_) => "bus_delivery_failed",
        }
    }

    /// The delivery aggregate, if this is a delivery failure.
    pub fn as_delivery(&self) -> Option<&DeliveryError> {
        match self {
            BusError::Delivery(e) => Some(e),
            _ => None,
        }
    }

    /// True when a handler cancellation is the primary cause.
    pub fn is_cancellation(&self) -> bool {
        self.as_delivery().is_some_and(DeliveryError::is_cancellation)
    }
}
