//! # Background compaction
//!
//! Disconnected connections stay on their node until a compaction pass
//! removes them. Passes are requested often (every `compaction_threshold`
//! disconnects) but must never pile up, so [`DebouncedTask`] coalesces them:
//!
//! ```text
//!            schedule()                 schedule() × N
//!   Idle ─────────────► Running ─────────────────────► Rerun
//!    ▲                     │  pass done                  │ pass done
//!    └─────────────────────┘                             ▼
//!                                               Running (one more pass)
//! ```
//!
//! - Requests while idle start a pass on the executor.
//! - Requests while a pass runs collapse into exactly one follow-up pass.
//! - A follow-up pass always starts after the request that caused it, so its
//!   removals cover everything disconnected before that request.
//!
//! Where a pass runs is decided by a [`CompactionExecutor`]: a dedicated OS
//! thread ([`ThreadExecutor`]), Tokio's blocking pool ([`TokioExecutor`]) or
//! the calling thread ([`InlineExecutor`]).

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

/// A unit of background work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs compaction passes somewhere other than the requesting thread.
pub trait CompactionExecutor: Send + Sync {
    /// Runs `job` exactly once.
    fn execute(&self, job: Job);
}

/// Spawns one named OS thread per pass chain.
#[derive(Debug, Clone)]
pub struct ThreadExecutor {
    thread_name: String,
}

impl ThreadExecutor {
    pub fn new(thread_name: impl Into<String>) -> Self {
        Self {
            thread_name: thread_name.into(),
        }
    }
}

impl CompactionExecutor for ThreadExecutor {
    fn execute(&self, job: Job) {
        let slot = Arc::new(Mutex::new(Some(job)));
        let remote = Arc::clone(&slot);
        let spawned = std::thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || {
                if let Some(job) = remote.lock().take() {
                    job();
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, thread = %self.thread_name, "Compaction thread spawn failed; running inline");
            if let Some(job) = slot.lock().take() {
                job();
            }
        }
    }
}

/// Runs passes on Tokio's blocking thread pool.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: tokio::runtime::Handle,
}

impl TokioExecutor {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Executor for the runtime the caller is running in, if any.
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl CompactionExecutor for TokioExecutor {
    fn execute(&self, job: Job) {
        // Detached: the pass reports through metrics, not the join handle.
        drop(self.handle.spawn_blocking(job));
    }
}

/// Runs passes synchronously on the requesting thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl CompactionExecutor for InlineExecutor {
    fn execute(&self, job: Job) {
        job();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassState {
    Idle,
    Running,
    Rerun,
}

/// At-least-once, coalescing background task.
pub struct DebouncedTask {
    name: &'static str,
    state: Mutex<PassState>,
    task: Box<dyn Fn() + Send + Sync>,
    executor: Arc<dyn CompactionExecutor>,
    passes: AtomicU64,
    requests: AtomicU64,
}

impl DebouncedTask {
    pub fn new(
        name: &'static str,
        executor: Arc<dyn CompactionExecutor>,
        task: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(PassState::Idle),
            task: Box::new(task),
            executor,
            passes: AtomicU64::new(0),
            requests: AtomicU64::new(0),
        })
    }

    /// Requests a pass.
    ///
    /// Returns `true` when this call started a new pass chain, `false` when
    /// it was folded into the running one.
    pub fn schedule(self: &Arc<Self>) -> bool {
        self.requests.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock();
            match *state {
                PassState::Idle => *state = PassState::Running,
                PassState::Running => {
                    *state = PassState::Rerun;
                    return false;
                }
                PassState::Rerun => return false,
            }
        }

        let task = Arc::clone(self);
        self.executor.execute(Box::new(move || task.run()));
        true
    }

    fn run(&self) {
        loop {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (self.task)())) {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                error!(task = self.name, panic = %message, "Background pass panicked");
            }
            self.passes.fetch_add(1, Ordering::AcqRel);

            let mut state = self.state.lock();
            match *state {
                PassState::Rerun => {
                    *state = PassState::Running;
                    debug!(task = self.name, "Requests arrived during pass; running again");
                }
                PassState::Running | PassState::Idle => {
                    *state = PassState::Idle;
                    break;
                }
            }
        }
    }

    /// Passes completed so far.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Acquire)
    }

    /// Calls to [`Self::schedule`] so far.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Whether a pass is running or queued.
    pub fn is_busy(&self) -> bool {
        *self.state.lock() != PassState::Idle
    }
}

impl fmt::Debug for DebouncedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebouncedTask")
            .field("name", &self.name)
            .field("state", &*self.state.lock())
            .field("passes", &self.passes())
            .finish()
    }
}
