//! Scope Provider Contract
//!
//! A scope is the scarce, thread-bound resource the producer runs inside
//! (a transactional session, a pooled connection with an open cursor, ...).
//! The bridge acquires exactly one scope per streaming call and terminates it
//! exactly once.
//!
//! # Thread Affinity
//!
//! [`ScopeHandle`] has no `Send` bound. A handle is opened on a worker thread,
//! used there, and terminated there; the type system keeps it from ever
//! crossing to the consumer. Only the items it produces (`T: Send + 'static`)
//! leave the worker.
//!
//! # Reentrancy
//!
//! When a stream is requested from inside another stream's producer, the
//! bridge runs the inner call synchronously on the producer's thread and calls
//! [`ScopeProvider::begin`] there. Providers backed by a bounded pool should
//! join the scope already open on that thread instead of waiting for a second
//! slot.

use serde::{Deserialize, Serialize};

use crate::error::BoxError;

/// Opens scopes
pub trait ScopeProvider: Send + Sync + 'static {
    /// The scope handle type
    type Handle: ScopeHandle;

    /// Begin a new scope. `readonly` is applied at acquisition time.
    fn begin(&self, readonly: bool) -> Result<Self::Handle, BoxError>;

    /// Maximum number of scopes the underlying resource can hold open at once
    ///
    /// Used as the default worker pool size so every worker can hold one
    /// scope without waiting on another.
    fn max_concurrent_scopes(&self) -> Option<usize> {
        None
    }
}

/// An open scope
pub trait ScopeHandle {
    /// Flush the scope's internal cache without ending the scope
    fn flush(&mut self) -> Result<(), BoxError>;

    /// End the scope successfully
    fn commit(self) -> Result<(), BoxError>;

    /// End the scope unsuccessfully, discarding pending effects
    fn rollback(self) -> Result<(), BoxError>;
}

/// Scope operations, used to label scope failures
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScopeOperation {
    /// Acquisition
    Begin,
    /// Periodic cache flush
    Flush,
    /// Successful termination
    Commit,
    /// Unsuccessful termination
    Rollback,
}

impl ScopeOperation {
    /// Lowercase label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::Flush => "flush",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        }
    }
}

impl std::fmt::Display for ScopeOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}
