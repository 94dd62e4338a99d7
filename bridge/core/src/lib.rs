//! Scoped Stream Core - Lazy Streams Out of Thread-Bound Scopes
//!
//! Some resources can only be used from the thread that opened them: a
//! database transaction, a session with an open cursor, a connection checked
//! out of a pool. Handing a lazy sequence produced inside such a scope to code
//! running elsewhere normally forces one of two bad choices: materialize
//! everything up front, or keep the scope open on the consumer's thread.
//!
//! This crate runs the producer inside its scope on a dedicated worker thread
//! and hands items to the consumer through a bounded buffer. The consumer sees
//! an ordinary iterator.
//!
//! # Architecture
//!
//! ```text
//!  caller thread                               worker thread (pool)
//! ┌──────────────────────────┐               ┌──────────────────────────────┐
//! │ StreamBridge::stream()   │── submit ───► │ ProducerTask                  │
//! │   │                      │  (context)    │   begin(readonly)             │
//! │   ▼                      │               │   supplier(&mut scope)        │
//! │ ScopedStream<T>          │               │   for item in source:         │
//! │   next() ◄── take() ─────┼── HandoffQueue ◄── put(item)                 │
//! │   drop() ─► close ───────┼──────────────►│   flush every N items         │
//! │                          │               │   commit | rollback (once)    │
//! └──────────────────────────┘               └──────────────────────────────┘
//! ```
//!
//! When streaming is disabled, or `stream()` is called from inside a producer,
//! the source is materialized synchronously on the calling thread instead.
//!
//! # Key Types
//!
//! - [`StreamBridge`]: the `stream()` entry point
//! - [`ScopedStream`]: the consumer's lazy iterator
//! - [`ScopeProvider`] / [`ScopeHandle`]: the resource being scoped
//! - [`BridgeConfig`]: process-wide settings
//! - [`DiagnosticContext`]: caller context carried into worker tasks
//! - [`InMemoryScopeProvider`]: bounded, journaling reference provider
//!
//! # Module Overview
//!
//! - [`bridge`]: entry point, per-call options, statistics
//! - [`handoff`]: bounded producer/consumer buffer with terminal markers
//! - [`pool`]: fixed-size worker pool with reentrancy detection
//! - [`producer`]: the scoped producer state machine
//! - [`sequence`]: consumer-side iterator
//! - [`fallback`]: synchronous materialization
//! - [`scope`]: scope provider contract
//! - [`context`]: diagnostic context propagation
//! - [`config`]: configuration loading
//! - [`error`]: error types
//! - [`memory`]: in-memory scope provider

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bridge;
pub mod config;
pub mod context;
pub mod error;
pub mod fallback;
pub mod handoff;
pub mod memory;
pub mod pool;
pub mod producer;
pub mod scope;
pub mod sequence;

pub use bridge::{BridgeStats, OperationDescriptor, StreamBridge, StreamId, StreamOptions};
pub use context::{ContextGuard, DiagnosticContext};
pub use error::{BoxError, StreamError};
pub use fallback::{materialize, Materialized};
pub use handoff::{ConsumerClosed, HandoffQueue, Item, QueueState};
pub use memory::{InMemoryScopeProvider, MemoryScope, ScopeCache, ScopeOutcome, ScopeRecord};
pub use pool::{PoolStats, Submission, WorkerPool};
pub use producer::{FlushPolicy, ProducerOutcome};
pub use scope::{ScopeHandle, ScopeOperation, ScopeProvider};
pub use sequence::ScopedStream;

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, BridgeConfig, ConfigError,
    ConfigOverrides, ConfigSource, DEFAULT_POOL_SIZE,
};
