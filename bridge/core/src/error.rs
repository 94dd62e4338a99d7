//! Error Types
//!
//! Everything that can go wrong between `stream()` and the last pull.
//!
//! Producer-side failures ([`StreamError::Supplier`], [`StreamError::Scope`],
//! [`StreamError::ProducerPanicked`]) never reach the caller directly. They
//! travel through the handoff queue as the terminal marker and are raised on
//! the pull that reaches it. Submission failures ([`StreamError::PoolExhausted`],
//! [`StreamError::PoolClosed`], [`StreamError::TypeMismatch`]) are returned
//! synchronously from `stream()`.

use thiserror::Error;

use crate::scope::ScopeOperation;

/// Boxed error from a collaborator (scope provider or source sequence)
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the bridge
#[derive(Debug, Error)]
pub enum StreamError {
    /// The supplier or the source sequence failed mid-iteration
    #[error("source sequence failed: {0}")]
    Supplier(#[source] BoxError),

    /// Acquiring, flushing or terminating the scope failed
    #[error("scope {operation} failed: {source}")]
    Scope {
        /// Which scope operation failed
        operation: ScopeOperation,
        /// Provider error
        #[source]
        source: BoxError,
    },

    /// The bridge was applied to an operation that does not return a sequence
    #[error("operation `{operation}` does not return a sequence (declared: {declared})")]
    TypeMismatch {
        /// Operation name
        operation: String,
        /// Declared return type
        declared: String,
    },

    /// No worker available and the submission queue is full
    #[error("worker pool exhausted: {in_flight} tasks in flight for {pool_size} workers")]
    PoolExhausted {
        /// Number of workers
        pool_size: usize,
        /// Tasks running or waiting at the time of rejection
        in_flight: usize,
    },

    /// The worker pool has been shut down
    #[error("worker pool is shut down")]
    PoolClosed,

    /// The worker threads could not be started
    #[error("failed to start worker pool: {0}")]
    WorkerStartup(#[source] std::io::Error),

    /// The supplier or source sequence panicked on the worker
    #[error("producer panicked: {0}")]
    ProducerPanicked(String),
}

impl StreamError {
    /// Wrap a source sequence failure
    pub fn supplier(error: impl Into<BoxError>) -> Self {
        Self::Supplier(error.into())
    }

    /// Wrap a scope provider failure
    pub fn scope(operation: ScopeOperation, error: impl Into<BoxError>) -> Self {
        Self::Scope {
            operation,
            source: error.into(),
        }
    }

    /// Whether this error was raised by the producer side (delivered via the
    /// terminal marker) rather than at submission time
    #[must_use]
    pub fn is_producer_side(&self) -> bool {
        matches!(
            self,
            Self::Supplier(_) | Self::Scope { .. } | Self::ProducerPanicked(_)
        )
    }

    /// Build a [`StreamError::ProducerPanicked`] from a caught panic payload
    pub(crate) fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        Self::ProducerPanicked(panic_message(payload))
    }
}

/// Extract a readable message from a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StreamError::supplier("cursor reset");
        assert_eq!(err.to_string(), "source sequence failed: cursor reset");

        let err = StreamError::scope(ScopeOperation::Commit, "deadlock detected");
        assert_eq!(err.to_string(), "scope commit failed: deadlock detected");

        let err = StreamError::PoolExhausted {
            pool_size: 2,
            in_flight: 5,
        };
        assert_eq!(
            err.to_string(),
            "worker pool exhausted: 5 tasks in flight for 2 workers"
        );
    }

    #[test]
    fn test_producer_side_classification() {
        assert!(StreamError::supplier("x").is_producer_side());
        assert!(StreamError::scope(ScopeOperation::Begin, "x").is_producer_side());
        assert!(StreamError::ProducerPanicked("boom".into()).is_producer_side());
        assert!(!StreamError::PoolClosed.is_producer_side());
        assert!(!StreamError::TypeMismatch {
            operation: "find_all".into(),
            declared: "Vec<Person>".into(),
        }
        .is_producer_side());
    }

    #[test]
    fn test_source_is_preserved() {
        use std::error::Error as _;

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = StreamError::supplier(io);
        let source = err.source().map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("disk gone"));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload.as_ref()), "static str");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn std::any::Any + Send> = Box::new(42_u32);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
