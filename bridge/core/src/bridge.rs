//! Stream Bridge
//!
//! The `stream()` entry point. Picks a mode per call:
//!
//! - **Concurrent** (default): a fresh handoff queue, a producer task on the
//!   worker pool, and a lazy [`ScopedStream`] for the caller.
//! - **Fallback**: streaming disabled, or the caller is itself a producer
//!   task. The source is materialized synchronously on the calling thread.
//!
//! # Example
//!
//! ```
//! use std::convert::Infallible;
//! use scoped_stream_core::{BridgeConfig, InMemoryScopeProvider, StreamBridge, StreamOptions};
//!
//! let bridge = StreamBridge::new(InMemoryScopeProvider::new(), BridgeConfig::default())?;
//!
//! let stream = bridge.stream(
//!     |_scope| Ok::<_, Infallible>((1..=3u32).map(Ok)),
//!     StreamOptions::readonly().with_buffer_capacity(2),
//! )?;
//!
//! let values: Vec<u32> = stream.collect::<Result<_, _>>()?;
//! assert_eq!(values, vec![1, 2, 3]);
//! # Ok::<(), scoped_stream_core::StreamError>(())
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::BridgeConfig;
use crate::context::DiagnosticContext;
use crate::error::{BoxError, StreamError};
use crate::fallback::run_fallback;
use crate::handoff::HandoffQueue;
use crate::pool::WorkerPool;
use crate::producer::{FlushPolicy, ProducerTask};
use crate::scope::ScopeProvider;
use crate::sequence::ScopedStream;

// ============================================================================
// Identifiers and Options
// ============================================================================

/// Identifier of one streaming call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub Uuid);

impl StreamId {
    /// Generate a new random ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-call options
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOptions {
    /// Open the scope read-only
    pub readonly: bool,
    /// Flush the scope after every this many items (0 = never)
    pub clear_resource_every: usize,
    /// Requested buffer capacity, capped by the configured maximum
    pub buffer_capacity: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            readonly: true,
            clear_resource_every: 0,
            buffer_capacity: 1000,
        }
    }
}

impl StreamOptions {
    /// Read-only scope, no flushing, default buffer
    #[must_use]
    pub fn readonly() -> Self {
        Self::default()
    }

    /// Read-write scope, no flushing, default buffer
    #[must_use]
    pub fn read_write() -> Self {
        Self {
            readonly: false,
            ..Self::default()
        }
    }

    /// Seed from configuration defaults
    #[must_use]
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            readonly: true,
            clear_resource_every: config.clear_resource_interval,
            buffer_capacity: config.max_buffer_capacity,
        }
    }

    /// Set the read-only flag
    #[must_use]
    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    /// Set the flush interval
    #[must_use]
    pub fn with_clear_resource_every(mut self, every: usize) -> Self {
        self.clear_resource_every = every;
        self
    }

    /// Set the requested buffer capacity
    #[must_use]
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Capacity actually used: capped at `ceiling`, at least 1
    #[must_use]
    pub fn effective_capacity(&self, ceiling: usize) -> usize {
        self.buffer_capacity.min(ceiling).max(1)
    }
}

// ============================================================================
// Operation Descriptor
// ============================================================================

/// Declares what an operation returns, so the bridge can refuse operations
/// that do not produce a sequence before anything is submitted
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    /// Operation name (for errors and logs)
    pub name: String,
    /// Declared return type, human readable
    pub declared_return: String,
    /// Whether the operation returns a sequence
    pub returns_sequence: bool,
}

impl OperationDescriptor {
    /// An operation returning a sequence of `T`
    #[must_use]
    pub fn sequence_of<T>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declared_return: format!("sequence of {}", std::any::type_name::<T>()),
            returns_sequence: true,
        }
    }

    /// An operation returning a single `R` (not streamable)
    #[must_use]
    pub fn returning<R>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declared_return: std::any::type_name::<R>().to_string(),
            returns_sequence: false,
        }
    }

    /// Fail with [`StreamError::TypeMismatch`] unless the operation returns a
    /// sequence
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.returns_sequence {
            Ok(())
        } else {
            Err(StreamError::TypeMismatch {
                operation: self.name.clone(),
                declared: self.declared_return.clone(),
            })
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Snapshot of bridge statistics
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStats {
    /// Streams handed to the worker pool
    pub concurrent_streams: u64,
    /// Streams materialized on the calling thread
    pub fallback_streams: u64,
    /// Streams whose scope was committed
    pub completed: u64,
    /// Streams that ended with an error
    pub failed: u64,
    /// Streams closed early by the consumer
    pub cancelled: u64,
    /// Submissions refused by the pool
    pub rejected: u64,
    /// Items taken from sources
    pub items_produced: u64,
    /// Scope flushes performed
    pub flushes: u64,
}

/// Atomic statistics for lock-free updates
#[derive(Debug, Default)]
pub(crate) struct BridgeStatsAtomic {
    concurrent_streams: AtomicU64,
    fallback_streams: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    rejected: AtomicU64,
    items_produced: AtomicU64,
    flushes: AtomicU64,
}

impl BridgeStatsAtomic {
    pub(crate) fn snapshot(&self) -> BridgeStats {
        BridgeStats {
            concurrent_streams: self.concurrent_streams.load(Ordering::Relaxed),
            fallback_streams: self.fallback_streams.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            items_produced: self.items_produced.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }

    fn record_work(&self, produced: u64, flushes: u64) {
        self.items_produced.fetch_add(produced, Ordering::Relaxed);
        self.flushes.fetch_add(flushes, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self, produced: u64, flushes: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.record_work(produced, flushes);
    }

    pub(crate) fn record_failed(&self, produced: u64, flushes: u64) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.record_work(produced, flushes);
    }

    pub(crate) fn record_cancelled(&self, produced: u64, flushes: u64) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
        self.record_work(produced, flushes);
    }
}

// ============================================================================
// Stream Bridge
// ============================================================================

/// Streams items produced inside provider scopes to consumers on other threads
pub struct StreamBridge<P: ScopeProvider> {
    provider: Arc<P>,
    pool: Arc<WorkerPool>,
    config: Arc<BridgeConfig>,
    stats: Arc<BridgeStatsAtomic>,
}

impl<P: ScopeProvider> Clone for StreamBridge<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            pool: Arc::clone(&self.pool),
            config: Arc::clone(&self.config),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<P: ScopeProvider> StreamBridge<P> {
    /// Create a bridge with its own worker pool
    ///
    /// The pool size is `config.worker_pool_size`, else the provider's
    /// concurrency ceiling, else the default.
    pub fn new(provider: P, config: BridgeConfig) -> Result<Self, StreamError> {
        let size = config.resolved_pool_size(provider.max_concurrent_scopes());
        let pool = WorkerPool::new(size, &config)?;
        Ok(Self::with_pool(Arc::new(provider), Arc::new(pool), config))
    }

    /// Create a bridge on an existing worker pool
    #[must_use]
    pub fn with_pool(provider: Arc<P>, pool: Arc<WorkerPool>, config: BridgeConfig) -> Self {
        tracing::debug!(
            enabled = config.enabled,
            max_buffer_capacity = config.max_buffer_capacity,
            pool_size = pool.size(),
            source = ?config.source(),
            "Stream bridge created"
        );
        Self {
            provider,
            pool,
            config: Arc::new(config),
            stats: Arc::new(BridgeStatsAtomic::default()),
        }
    }

    /// Scope provider
    #[must_use]
    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// Worker pool
    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Effective configuration
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Options seeded from the configuration
    #[must_use]
    pub fn default_options(&self) -> StreamOptions {
        StreamOptions::from_config(&self.config)
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> BridgeStats {
        self.stats.snapshot()
    }

    /// Run `supplier` inside a fresh scope and stream its items back
    ///
    /// The supplier runs on a worker thread with the caller's
    /// [`DiagnosticContext`]. Its source is pulled lazily as the returned
    /// stream is consumed, at most `options.buffer_capacity` items ahead
    /// (capped by `max_buffer_capacity`). The scope is committed when the
    /// source is exhausted and rolled back on any failure or early close.
    ///
    /// Supplier, source and scope failures are delivered through the stream,
    /// after the items produced before them.
    ///
    /// # Errors
    ///
    /// Only submission failures: [`StreamError::PoolExhausted`] and
    /// [`StreamError::PoolClosed`].
    pub fn stream<F, S, T, E>(
        &self,
        supplier: F,
        options: StreamOptions,
    ) -> Result<ScopedStream<T>, StreamError>
    where
        F: FnOnce(&mut P::Handle) -> Result<S, E> + Send + 'static,
        S: IntoIterator<Item = Result<T, E>>,
        T: Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let stream_id = StreamId::new();
        let flush = FlushPolicy::every(options.clear_resource_every);

        if !self.config.enabled || WorkerPool::in_worker() {
            tracing::debug!(
                %stream_id,
                enabled = self.config.enabled,
                reentrant = WorkerPool::in_worker(),
                "Materializing stream on the calling thread"
            );
            self.stats.fallback_streams.fetch_add(1, Ordering::Relaxed);
            return Ok(run_fallback(
                stream_id,
                self.provider.as_ref(),
                options.readonly,
                supplier,
                flush,
                &self.stats,
            ));
        }

        let capacity = options.effective_capacity(self.config.max_buffer_capacity);
        let queue = Arc::new(HandoffQueue::new(capacity));
        let task = ProducerTask::new(
            stream_id,
            Arc::clone(&self.provider),
            supplier,
            Arc::clone(&queue),
            options.readonly,
            flush,
            Arc::clone(&self.stats),
        );

        let context = DiagnosticContext::current();
        let span = tracing::debug_span!(
            "stream",
            %stream_id,
            readonly = options.readonly,
            capacity,
            context = %context
        );
        let submitted = span.in_scope(|| {
            self.pool.submit(context, move || {
                task.run();
            })
        });

        if let Err(e) = submitted {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        self.stats.concurrent_streams.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%stream_id, capacity, "Stream submitted");
        Ok(ScopedStream::handoff(stream_id, queue))
    }

    /// [`stream`](Self::stream) a declared operation
    ///
    /// # Errors
    ///
    /// [`StreamError::TypeMismatch`] if the operation does not return a
    /// sequence; nothing is submitted and the supplier is dropped unrun.
    pub fn stream_operation<F, S, T, E>(
        &self,
        operation: &OperationDescriptor,
        supplier: F,
        options: StreamOptions,
    ) -> Result<ScopedStream<T>, StreamError>
    where
        F: FnOnce(&mut P::Handle) -> Result<S, E> + Send + 'static,
        S: IntoIterator<Item = Result<T, E>>,
        T: Send + 'static,
        E: Into<BoxError> + 'static,
    {
        if let Err(e) = operation.validate() {
            tracing::warn!(operation = %operation.name, error = %e, "Refusing to stream operation");
            return Err(e);
        }
        self.stream(supplier, options)
    }

    /// Stop the worker pool
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

impl<P: ScopeProvider> std::fmt::Debug for StreamBridge<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBridge")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}
