//! In-Memory Scope Provider
//!
//! A reference [`ScopeProvider`] with the shape of a pooled transactional
//! resource:
//!
//! - an optional ceiling on open scopes; `begin` blocks until a slot frees up
//! - a journal of every scope opened and how it ended
//! - a per-scope cache that grows as items are loaded and is emptied by flush
//! - fault injection for `begin` and `commit`
//!
//! A `begin` on a thread that already holds a slot from the same provider
//! joins that slot instead of waiting for another one, so a nested stream on
//! a fully booked provider cannot wait on itself.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::BoxError;
use crate::scope::{ScopeHandle, ScopeProvider};

static NEXT_PROVIDER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Providers holding a slot on this thread
    static HELD: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

// ============================================================================
// Journal
// ============================================================================

/// How a scope ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeOutcome {
    /// Committed
    Committed,
    /// Rolled back (explicitly, after a failed commit, or dropped open)
    RolledBack,
}

/// Journal entry for one scope
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRecord {
    /// Sequential scope id
    pub id: u64,
    /// Opened read-only
    pub readonly: bool,
    /// Name of the thread that opened it
    pub thread: Option<String>,
    /// Joined a slot already held by this thread
    pub joined: bool,
    /// Flushes performed
    pub flushes: usize,
    /// Most entries the cache held at once
    pub peak_cache: usize,
    /// Termination, `None` while open
    pub outcome: Option<ScopeOutcome>,
}

// ============================================================================
// Scope Cache
// ============================================================================

#[derive(Debug, Default)]
struct CacheState {
    entries: usize,
    peak: usize,
    loaded: u64,
}

/// First-level cache of a scope
///
/// Cloning shares the cache. A source sequence can hold a clone and record
/// each item it loads; the scope's flush empties it.
#[derive(Clone, Debug, Default)]
pub struct ScopeCache {
    state: Rc<RefCell<CacheState>>,
}

impl ScopeCache {
    /// Record one loaded entry
    pub fn track(&self) {
        let mut state = self.state.borrow_mut();
        state.entries += 1;
        state.loaded += 1;
        state.peak = state.peak.max(state.entries);
    }

    /// Entries currently cached
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.borrow().entries
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most entries cached at once
    #[must_use]
    pub fn peak(&self) -> usize {
        self.state.borrow().peak
    }

    /// Entries loaded over the scope's lifetime
    #[must_use]
    pub fn loaded(&self) -> u64 {
        self.state.borrow().loaded
    }

    fn clear(&self) {
        self.state.borrow_mut().entries = 0;
    }
}

// ============================================================================
// Provider
// ============================================================================

#[derive(Debug, Default)]
struct State {
    open: usize,
    peak_open: usize,
    next_id: u64,
    records: Vec<ScopeRecord>,
    terminated: usize,
}

#[derive(Debug)]
struct Shared {
    instance: u64,
    max_open: Option<usize>,
    fail_begin: AtomicBool,
    fail_commit: AtomicBool,
    state: Mutex<State>,
    /// Signalled when a scope terminates
    changed: Condvar,
}

/// Journaling scope provider with an optional open-scope ceiling
///
/// Clones share the same slots and journal.
#[derive(Clone, Debug)]
pub struct InMemoryScopeProvider {
    shared: Arc<Shared>,
}

impl Default for InMemoryScopeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryScopeProvider {
    /// Unbounded provider
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Provider allowing at most `max_open` scopes at once (at least 1)
    #[must_use]
    pub fn with_max_open(max_open: usize) -> Self {
        Self::build(Some(max_open.max(1)))
    }

    fn build(max_open: Option<usize>) -> Self {
        Self {
            shared: Arc::new(Shared {
                instance: NEXT_PROVIDER.fetch_add(1, Ordering::Relaxed),
                max_open,
                fail_begin: AtomicBool::new(false),
                fail_commit: AtomicBool::new(false),
                state: Mutex::new(State::default()),
                changed: Condvar::new(),
            }),
        }
    }

    /// Make every `begin` fail
    #[must_use]
    pub fn fail_begin(self) -> Self {
        self.set_fail_begin(true);
        self
    }

    /// Make every `commit` fail (the scope ends rolled back)
    #[must_use]
    pub fn fail_commit(self) -> Self {
        self.set_fail_commit(true);
        self
    }

    /// Toggle `begin` failures
    pub fn set_fail_begin(&self, fail: bool) {
        self.shared.fail_begin.store(fail, Ordering::SeqCst);
    }

    /// Toggle `commit` failures
    pub fn set_fail_commit(&self, fail: bool) {
        self.shared.fail_commit.store(fail, Ordering::SeqCst);
    }

    /// Slots currently held
    #[must_use]
    pub fn open_scopes(&self) -> usize {
        self.shared.state.lock().open
    }

    /// Most slots ever held at once
    #[must_use]
    pub fn peak_open_scopes(&self) -> usize {
        self.shared.state.lock().peak_open
    }

    /// Scopes committed or rolled back so far
    #[must_use]
    pub fn terminations(&self) -> usize {
        self.shared.state.lock().terminated
    }

    /// Copy of the journal, in opening order
    #[must_use]
    pub fn records(&self) -> Vec<ScopeRecord> {
        self.shared.state.lock().records.clone()
    }

    /// Block until at least `count` scopes have terminated or `timeout`
    /// elapses; returns `true` if the count was reached
    pub fn wait_for_terminations(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.terminated < count {
            if self.shared.changed.wait_until(&mut state, deadline).timed_out() {
                return state.terminated >= count;
            }
        }
        true
    }

    fn holds_slot(&self) -> bool {
        HELD.with(|held| held.borrow().contains(&self.shared.instance))
    }
}

impl ScopeProvider for InMemoryScopeProvider {
    type Handle = MemoryScope;

    fn begin(&self, readonly: bool) -> Result<MemoryScope, BoxError> {
        if self.shared.fail_begin.load(Ordering::SeqCst) {
            return Err("scope provider refused connection".into());
        }

        let joined = self.holds_slot();
        let mut state = self.shared.state.lock();
        if !joined {
            if let Some(max_open) = self.shared.max_open {
                while state.open >= max_open {
                    self.shared.changed.wait(&mut state);
                }
            }
            state.open += 1;
            state.peak_open = state.peak_open.max(state.open);
        }

        let id = state.next_id;
        state.next_id += 1;
        let index = state.records.len();
        state.records.push(ScopeRecord {
            id,
            readonly,
            thread: std::thread::current().name().map(str::to_string),
            joined,
            flushes: 0,
            peak_cache: 0,
            outcome: None,
        });
        drop(state);

        if !joined {
            HELD.with(|held| held.borrow_mut().push(self.shared.instance));
        }
        tracing::trace!(scope_id = id, readonly, joined, "Scope opened");

        Ok(MemoryScope {
            shared: Arc::clone(&self.shared),
            id,
            index,
            joined,
            flushes: 0,
            cache: ScopeCache::default(),
            finished: false,
            _thread_bound: PhantomData,
        })
    }

    fn max_concurrent_scopes(&self) -> Option<usize> {
        self.shared.max_open
    }
}

// ============================================================================
// Scope Handle
// ============================================================================

/// An open scope from [`InMemoryScopeProvider`]
///
/// Not `Send`: it stays on the thread that opened it.
#[derive(Debug)]
pub struct MemoryScope {
    shared: Arc<Shared>,
    id: u64,
    index: usize,
    joined: bool,
    flushes: usize,
    cache: ScopeCache,
    finished: bool,
    _thread_bound: PhantomData<Rc<()>>,
}

impl MemoryScope {
    /// Sequential scope id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Flushes performed so far
    #[must_use]
    pub fn flushes(&self) -> usize {
        self.flushes
    }

    /// Shared handle to this scope's cache
    #[must_use]
    pub fn cache(&self) -> ScopeCache {
        self.cache.clone()
    }

    fn finish(&mut self, outcome: ScopeOutcome) {
        self.finished = true;
        let mut state = self.shared.state.lock();
        if let Some(record) = state.records.get_mut(self.index) {
            record.outcome = Some(outcome);
            record.flushes = self.flushes;
            record.peak_cache = self.cache.peak();
        }
        if !self.joined {
            state.open = state.open.saturating_sub(1);
        }
        state.terminated += 1;
        drop(state);
        self.shared.changed.notify_all();

        if !self.joined {
            let instance = self.shared.instance;
            HELD.with(|held| {
                let mut held = held.borrow_mut();
                if let Some(pos) = held.iter().rposition(|&i| i == instance) {
                    held.remove(pos);
                }
            });
        }
        tracing::trace!(scope_id = self.id, ?outcome, "Scope ended");
    }
}

impl ScopeHandle for MemoryScope {
    fn flush(&mut self) -> Result<(), BoxError> {
        self.cache.clear();
        self.flushes += 1;
        Ok(())
    }

    fn commit(mut self) -> Result<(), BoxError> {
        if self.shared.fail_commit.load(Ordering::SeqCst) {
            self.finish(ScopeOutcome::RolledBack);
            return Err("commit rejected by scope provider".into());
        }
        self.finish(ScopeOutcome::Committed);
        Ok(())
    }

    fn rollback(mut self) -> Result<(), BoxError> {
        self.finish(ScopeOutcome::RolledBack);
        Ok(())
    }
}

impl Drop for MemoryScope {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(scope_id = self.id, "Scope dropped while open, rolling back");
            self.finish(ScopeOutcome::RolledBack);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_journal_records_outcomes() {
        let provider = InMemoryScopeProvider::new();

        let scope = provider.begin(true).unwrap();
        assert_eq!(provider.open_scopes(), 1);
        scope.commit().unwrap();

        let scope = provider.begin(false).unwrap();
        scope.rollback().unwrap();

        let records = provider.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].outcome, Some(ScopeOutcome::Committed));
        assert!(records[0].readonly);
        assert_eq!(records[1].outcome, Some(ScopeOutcome::RolledBack));
        assert!(!records[1].readonly);
        assert_eq!(provider.open_scopes(), 0);
        assert_eq!(provider.terminations(), 2);
    }

    #[test]
    fn test_flush_clears_cache() {
        let provider = InMemoryScopeProvider::new();
        let mut scope = provider.begin(true).unwrap();
        let cache = scope.cache();

        for _ in 0..5 {
            cache.track();
        }
        assert_eq!(cache.len(), 5);
        scope.flush().unwrap();
        assert!(cache.is_empty());
        cache.track();
        scope.commit().unwrap();

        let record = &provider.records()[0];
        assert_eq!(record.flushes, 1);
        assert_eq!(record.peak_cache, 5);
        assert_eq!(cache.loaded(), 6);
    }

    #[test]
    fn test_ceiling_blocks_begin() {
        let provider = InMemoryScopeProvider::with_max_open(1);
        assert_eq!(provider.max_concurrent_scopes(), Some(1));
        let first = provider.begin(true).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let provider = provider.clone();
            std::thread::spawn(move || {
                let scope = provider.begin(true).unwrap();
                tx.send(()).unwrap();
                scope.commit().unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        first.commit().unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();

        assert_eq!(provider.peak_open_scopes(), 1);
        assert!(provider.wait_for_terminations(2, Duration::from_secs(5)));
    }

    #[test]
    fn test_nested_begin_joins_held_slot() {
        let provider = InMemoryScopeProvider::with_max_open(1);
        let outer = provider.begin(true).unwrap();
        let inner = provider.begin(true).unwrap();

        assert_eq!(provider.open_scopes(), 1);
        inner.commit().unwrap();
        assert_eq!(provider.open_scopes(), 1);
        outer.commit().unwrap();
        assert_eq!(provider.open_scopes(), 0);

        let records = provider.records();
        assert!(!records[0].joined);
        assert!(records[1].joined);
    }

    #[test]
    fn test_fault_injection() {
        let provider = InMemoryScopeProvider::new().fail_begin();
        assert!(provider.begin(true).is_err());
        provider.set_fail_begin(false);

        provider.set_fail_commit(true);
        let scope = provider.begin(true).unwrap();
        assert!(scope.commit().is_err());
        assert_eq!(provider.records()[0].outcome, Some(ScopeOutcome::RolledBack));
        assert_eq!(provider.open_scopes(), 0);
    }

    #[test]
    fn test_dropped_scope_rolls_back() {
        let provider = InMemoryScopeProvider::new();
        drop(provider.begin(true).unwrap());
        assert_eq!(provider.records()[0].outcome, Some(ScopeOutcome::RolledBack));
        assert_eq!(provider.terminations(), 1);
    }

    #[test]
    fn test_wait_for_terminations_times_out() {
        let provider = InMemoryScopeProvider::new();
        assert!(!provider.wait_for_terminations(1, Duration::from_millis(20)));
        assert!(provider.wait_for_terminations(0, Duration::from_millis(20)));
    }
}
