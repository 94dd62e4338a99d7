//! Worker Pool
//!
//! Fixed-size pool of worker threads that run producer tasks. The size
//! mirrors the scope provider's concurrency ceiling so every worker can hold
//! one scope at a time without waiting on another worker.
//!
//! # Design
//!
//! Workers are the blocking-thread pool of a dedicated tokio runtime built
//! with `max_blocking_threads(size)`. Submissions beyond the pool size wait in
//! the runtime's queue; an optional queue capacity turns excess submissions
//! into [`StreamError::PoolExhausted`].
//!
//! Every task runs with a thread-local flag set. A submission made while that
//! flag is set (a task submitting another task) is not queued: it runs inline
//! on the calling worker. Otherwise a pool of size 1 whose only worker waits
//! on its own nested submission would never make progress.
//!
//! Panics inside tasks are caught and logged. They never reach the submitter.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::runtime::Runtime;

use crate::config::BridgeConfig;
use crate::context::DiagnosticContext;
use crate::error::{panic_message, StreamError};

thread_local! {
    static IN_WORKER_TASK: Cell<bool> = const { Cell::new(false) };
}

// ============================================================================
// Statistics
// ============================================================================

/// Snapshot of pool statistics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of worker threads
    pub size: usize,
    /// Tasks running or waiting for a worker
    pub in_flight: usize,
    /// Tasks currently running
    pub active: usize,
    /// Most tasks ever running at once
    pub peak_active: usize,
    /// Tasks submitted to the workers
    pub submitted: u64,
    /// Tasks that finished (including panicked ones)
    pub completed: u64,
    /// Submissions rejected with `PoolExhausted`
    pub rejected: u64,
    /// Reentrant submissions run inline on the caller
    pub inline_runs: u64,
    /// Tasks that panicked
    pub panics: u64,
}

/// Atomic statistics for lock-free updates
#[derive(Default)]
struct PoolStatsAtomic {
    in_flight: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
    submitted: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    inline_runs: AtomicU64,
    panics: AtomicU64,
    /// Guards idle notification
    idle_lock: Mutex<()>,
    idle: Condvar,
}

impl PoolStatsAtomic {
    fn snapshot(&self, size: usize) -> PoolStats {
        PoolStats {
            size,
            in_flight: self.in_flight.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            peak_active: self.peak_active.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            inline_runs: self.inline_runs.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }

    /// Give back an `in_flight` slot, waking idle waiters on the last one
    fn release_slot(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _lock = self.idle_lock.lock();
            self.idle.notify_all();
        }
    }

    fn record_started(&self) {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(active, Ordering::SeqCst);
    }
}

/// Holds one `in_flight` slot; released when the task finishes or is dropped
/// unrun (runtime shutdown)
struct InFlightSlot {
    stats: Arc<PoolStatsAtomic>,
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
        self.stats.release_slot();
    }
}

/// Marks the current thread as running a pool task
struct WorkerFlag {
    previous: bool,
}

impl WorkerFlag {
    fn set() -> Self {
        let previous = IN_WORKER_TASK.with(|flag| flag.replace(true));
        Self { previous }
    }
}

impl Drop for WorkerFlag {
    fn drop(&mut self) {
        IN_WORKER_TASK.with(|flag| flag.set(self.previous));
    }
}

// ============================================================================
// Worker Pool
// ============================================================================

/// How a submitted task was scheduled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submission {
    /// Handed to the workers; runs asynchronously
    Queued,
    /// Reentrant submission; already ran on the calling thread
    Inline,
}

/// Fixed-size pool of worker threads
pub struct WorkerPool {
    size: usize,
    queue_capacity: Option<usize>,
    runtime: Mutex<Option<Runtime>>,
    stats: Arc<PoolStatsAtomic>,
}

impl WorkerPool {
    /// Start a pool with `size` workers using the config's thread naming and
    /// queue capacity
    pub fn new(size: usize, config: &BridgeConfig) -> Result<Self, StreamError> {
        let size = size.max(1);
        let prefix = config.thread_name_prefix.clone();
        let next_id = AtomicUsize::new(1);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .max_blocking_threads(size)
            .thread_name_fn(move || {
                format!("{prefix}{}", next_id.fetch_add(1, Ordering::Relaxed))
            })
            .build()
            .map_err(StreamError::WorkerStartup)?;

        tracing::info!(
            size,
            queue_capacity = ?config.worker_queue_capacity,
            "Worker pool started"
        );

        Ok(Self {
            size,
            queue_capacity: config.worker_queue_capacity,
            runtime: Mutex::new(Some(runtime)),
            stats: Arc::new(PoolStatsAtomic::default()),
        })
    }

    /// Whether the current thread is executing a pool task
    #[must_use]
    pub fn in_worker() -> bool {
        IN_WORKER_TASK.with(Cell::get)
    }

    /// Number of worker threads
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the pool still accepts submissions
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot(self.size)
    }

    /// Run `task` on a worker with `context` installed
    ///
    /// Called from inside a pool task, the submission is refused and `task`
    /// runs synchronously on the caller instead ([`Submission::Inline`]).
    /// `StreamBridge` never gets here on reentry since it materializes first;
    /// the inline path serves callers that submit to the pool directly.
    ///
    /// # Errors
    ///
    /// - [`StreamError::PoolExhausted`] if a queue capacity is configured and
    ///   already used up
    /// - [`StreamError::PoolClosed`] after [`shutdown`](Self::shutdown)
    pub fn submit<F>(&self, context: DiagnosticContext, task: F) -> Result<Submission, StreamError>
    where
        F: FnOnce() + Send + 'static,
    {
        if Self::in_worker() {
            tracing::debug!("Reentrant submission, running inline on the current worker");
            self.stats.inline_runs.fetch_add(1, Ordering::Relaxed);
            run_contained(&self.stats, task);
            return Ok(Submission::Inline);
        }

        let in_flight = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(capacity) = self.queue_capacity {
            if in_flight > self.size + capacity {
                self.stats.release_slot();
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    pool_size = self.size,
                    in_flight = in_flight - 1,
                    "Worker pool exhausted, rejecting submission"
                );
                return Err(StreamError::PoolExhausted {
                    pool_size: self.size,
                    in_flight: in_flight - 1,
                });
            }
        }

        let runtime = self.runtime.lock();
        let Some(runtime) = runtime.as_ref() else {
            self.stats.release_slot();
            return Err(StreamError::PoolClosed);
        };

        let slot = InFlightSlot {
            stats: Arc::clone(&self.stats),
        };
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        let stats = Arc::clone(&self.stats);
        let span = tracing::Span::current();
        runtime.spawn_blocking(move || {
            let _slot = slot;
            let _context = context.enter();
            let _flag = WorkerFlag::set();
            span.in_scope(|| run_contained(&stats, task));
        });

        Ok(Submission::Queued)
    }

    /// Block until no task is running or waiting, or `timeout` elapses
    ///
    /// Returns `true` if the pool went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut lock = self.stats.idle_lock.lock();
        while self.stats.in_flight.load(Ordering::SeqCst) > 0 {
            if self.stats.idle.wait_until(&mut lock, deadline).timed_out() {
                return self.stats.in_flight.load(Ordering::SeqCst) == 0;
            }
        }
        true
    }

    /// Stop accepting submissions
    ///
    /// Running tasks finish on their own; tasks still waiting for a worker
    /// are dropped without running.
    pub fn shutdown(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            tracing::info!(size = self.size, "Worker pool shutting down");
            runtime.shutdown_background();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("queue_capacity", &self.queue_capacity)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Run a task, logging instead of propagating a panic
fn run_contained<F: FnOnce()>(stats: &PoolStatsAtomic, task: F) {
    stats.record_started();
    let result = catch_unwind(AssertUnwindSafe(task));
    stats.active.fetch_sub(1, Ordering::SeqCst);

    if let Err(payload) = result {
        stats.panics.fetch_add(1, Ordering::Relaxed);
        tracing::error!(panic = %panic_message(payload.as_ref()), "Worker task panicked");
    }
}

// ============================================================================
// Tests
// ============================================================================
