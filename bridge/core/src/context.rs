//! Diagnostic Context
//!
//! Key/value pairs describing the request a stream was started for
//! (request id, tenant, user, ...). The caller's ambient context is captured
//! as a value when a stream is submitted, moved into the worker task, and
//! installed there for the task's duration. When the task ends the worker's
//! context is cleared again, so nothing leaks into the next task that thread
//! runs.
//!
//! ```
//! use scoped_stream_core::DiagnosticContext;
//!
//! let _request = DiagnosticContext::new()
//!     .with("request_id", "r-42")
//!     .enter();
//!
//! assert_eq!(DiagnosticContext::current().get("request_id"), Some("r-42"));
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

thread_local! {
    static CURRENT: RefCell<DiagnosticContext> = RefCell::new(DiagnosticContext::new());
}

/// A snapshot of diagnostic key/value pairs
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticContext {
    entries: BTreeMap<String, String>,
}

impl DiagnosticContext {
    /// Create an empty context
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the context installed on the current thread
    #[must_use]
    pub fn current() -> Self {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Add an entry (builder style)
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Add or replace an entry
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Look up an entry
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the context has no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Install this context on the current thread until the guard drops
    ///
    /// The previously installed context is restored on drop.
    #[must_use = "the context is removed again when the guard is dropped"]
    pub fn enter(self) -> ContextGuard {
        let previous = CURRENT.with(|current| current.replace(self));
        ContextGuard { previous }
    }
}

impl std::fmt::Display for DiagnosticContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (key, value) in &self.entries {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{key}={value}")?;
            first = false;
        }
        Ok(())
    }
}

/// Restores the previous thread context on drop
#[derive(Debug)]
pub struct ContextGuard {
    previous: DiagnosticContext,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = std::mem::take(&mut self.previous);
        CURRENT.with(|current| {
            current.replace(previous);
        });
    }
}
