//! Scoped Producer
//!
//! Runs on a worker thread. Opens one scope, drains the source sequence into
//! the handoff queue, and terminates the scope exactly once.
//!
//! ```text
//! ACQUIRE ──► ITERATE ──┬──► COMPLETE: drop source, commit,   close_by_producer(None)
//!                       └──► ABORT:    drop source, rollback, close_by_producer(Some(err))
//!                                      (no error marker when the consumer closed)
//! ```
//!
//! `commit` and `rollback` consume the scope handle, so a second termination
//! does not type-check.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::bridge::{BridgeStatsAtomic, StreamId};
use crate::error::{panic_message, BoxError, StreamError};
use crate::handoff::HandoffQueue;
use crate::scope::{ScopeHandle, ScopeOperation, ScopeProvider};

// ============================================================================
// Flush Policy
// ============================================================================

/// Decides when to flush the scope's cache during a long iteration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlushPolicy {
    every: usize,
    since_flush: usize,
}

impl FlushPolicy {
    /// Flush after every `every` items (0 = never)
    #[must_use]
    pub fn every(every: usize) -> Self {
        Self {
            every,
            since_flush: 0,
        }
    }

    /// Never flush
    #[must_use]
    pub fn never() -> Self {
        Self::every(0)
    }

    /// Configured interval (0 = never)
    #[must_use]
    pub fn interval(&self) -> usize {
        self.every
    }

    /// Count one produced item; returns `true` when a flush is due
    pub fn record_item(&mut self) -> bool {
        if self.every == 0 {
            return false;
        }
        self.since_flush += 1;
        if self.since_flush >= self.every {
            self.since_flush = 0;
            true
        } else {
            false
        }
    }
}

// ============================================================================
// Producer Task
// ============================================================================

/// How a producer run ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProducerOutcome {
    /// Source exhausted and scope committed
    Completed {
        /// Items handed to the consumer
        produced: u64,
    },
    /// Consumer closed early; scope rolled back
    ConsumerClosed {
        /// Items taken from the source (the last one may not have been delivered)
        produced: u64,
    },
    /// Supplier, source or scope failed; scope rolled back if it was opened
    Failed {
        /// Items taken from the source before the failure
        produced: u64,
    },
}

/// Running counters for one producer run
#[derive(Debug, Default)]
struct Progress {
    produced: u64,
    flushes: u64,
}

enum Drained {
    Exhausted,
    ConsumerClosed,
}

/// Closes the queue with an error if the task ends without closing it itself
///
/// Not yet started means the pool dropped the task unrun (`PoolClosed`).
/// Started means the run unwound past its own containment.
struct TerminalGuard<T> {
    stream_id: StreamId,
    queue: Arc<HandoffQueue<T>>,
    started: bool,
}

impl<T> Drop for TerminalGuard<T> {
    fn drop(&mut self) {
        if !self.started {
            if self.queue.close_by_producer(Some(StreamError::PoolClosed)) {
                tracing::debug!(stream_id = %self.stream_id, "Producer task dropped before it ran");
            }
            return;
        }
        let error = StreamError::ProducerPanicked("producer exited without closing its stream".into());
        if self.queue.close_by_producer(Some(error)) {
            tracing::error!(stream_id = %self.stream_id, "Producer exited without closing its stream");
        }
    }
}

/// One-shot producer bound to one queue and one scope acquisition
pub(crate) struct ProducerTask<P, F, T> {
    stream_id: StreamId,
    provider: Arc<P>,
    supplier: F,
    queue: Arc<HandoffQueue<T>>,
    readonly: bool,
    flush: FlushPolicy,
    stats: Arc<BridgeStatsAtomic>,
    guard: TerminalGuard<T>,
}

impl<P, F, S, T, E> ProducerTask<P, F, T>
where
    P: ScopeProvider,
    F: FnOnce(&mut P::Handle) -> Result<S, E>,
    S: IntoIterator<Item = Result<T, E>>,
    E: Into<BoxError>,
{
    pub(crate) fn new(
        stream_id: StreamId,
        provider: Arc<P>,
        supplier: F,
        queue: Arc<HandoffQueue<T>>,
        readonly: bool,
        flush: FlushPolicy,
        stats: Arc<BridgeStatsAtomic>,
    ) -> Self {
        let guard = TerminalGuard {
            stream_id,
            queue: Arc::clone(&queue),
            started: false,
        };
        Self {
            stream_id,
            provider,
            supplier,
            queue,
            readonly,
            flush,
            stats,
            guard,
        }
    }

    /// Run to termination
    pub(crate) fn run(self) -> ProducerOutcome {
        let Self {
            stream_id,
            provider,
            supplier,
            queue,
            readonly,
            mut flush,
            stats,
            mut guard,
        } = self;
        guard.started = true;

        tracing::debug!(%stream_id, readonly, "Acquiring scope");
        let mut scope = match begin(provider.as_ref(), readonly) {
            Ok(scope) => scope,
            Err(error) => {
                tracing::warn!(%stream_id, error = %error, "Scope acquisition failed");
                queue.close_by_producer(Some(error));
                stats.record_failed(0, 0);
                return ProducerOutcome::Failed { produced: 0 };
            }
        };

        let mut progress = Progress::default();
        let drained = catch_unwind(AssertUnwindSafe(|| {
            drain(&mut scope, supplier, &queue, &mut flush, &mut progress)
        }));

        let outcome = match drained {
            Ok(Ok(Drained::Exhausted)) => match commit(scope) {
                Ok(()) => {
                    queue.close_by_producer(None);
                    tracing::debug!(
                        %stream_id,
                        produced = progress.produced,
                        flushes = progress.flushes,
                        "Stream complete, scope committed"
                    );
                    stats.record_completed(progress.produced, progress.flushes);
                    ProducerOutcome::Completed {
                        produced: progress.produced,
                    }
                }
                Err(error) => {
                    tracing::warn!(%stream_id, error = %error, "Scope commit failed");
                    queue.close_by_producer(Some(error));
                    stats.record_failed(progress.produced, progress.flushes);
                    ProducerOutcome::Failed {
                        produced: progress.produced,
                    }
                }
            },
            Ok(Ok(Drained::ConsumerClosed)) => {
                rollback(stream_id, scope);
                tracing::debug!(
                    %stream_id,
                    produced = progress.produced,
                    "Consumer closed early, scope rolled back"
                );
                stats.record_cancelled(progress.produced, progress.flushes);
                ProducerOutcome::ConsumerClosed {
                    produced: progress.produced,
                }
            }
            Ok(Err(error)) => {
                tracing::warn!(
                    %stream_id,
                    produced = progress.produced,
                    error = %error,
                    "Producer failed, rolling back scope"
                );
                rollback(stream_id, scope);
                queue.close_by_producer(Some(error));
                stats.record_failed(progress.produced, progress.flushes);
                ProducerOutcome::Failed {
                    produced: progress.produced,
                }
            }
            Err(payload) => {
                let error = StreamError::from_panic(payload.as_ref());
                tracing::error!(%stream_id, error = %error, "Producer panicked, rolling back scope");
                rollback(stream_id, scope);
                queue.close_by_producer(Some(error));
                stats.record_failed(progress.produced, progress.flushes);
                ProducerOutcome::Failed {
                    produced: progress.produced,
                }
            }
        };

        drop(guard);
        outcome
    }
}

/// ITERATE: pull from the source and hand items over until exhaustion,
/// consumer close, or failure. The source is dropped on return.
fn drain<H, F, S, T, E>(
    scope: &mut H,
    supplier: F,
    queue: &HandoffQueue<T>,
    flush: &mut FlushPolicy,
    progress: &mut Progress,
) -> Result<Drained, StreamError>
where
    H: ScopeHandle,
    F: FnOnce(&mut H) -> Result<S, E>,
    S: IntoIterator<Item = Result<T, E>>,
    E: Into<BoxError>,
{
    let source = supplier(scope).map_err(StreamError::supplier)?;

    for item in source {
        let value = item.map_err(StreamError::supplier)?;
        progress.produced += 1;

        if queue.put(value).is_err() {
            return Ok(Drained::ConsumerClosed);
        }

        if flush.record_item() {
            scope
                .flush()
                .map_err(|e| StreamError::scope(ScopeOperation::Flush, e))?;
            progress.flushes += 1;
        }
    }

    Ok(Drained::Exhausted)
}

/// ACQUIRE with a panicking provider reported as a begin failure
pub(crate) fn begin<P: ScopeProvider>(provider: &P, readonly: bool) -> Result<P::Handle, StreamError> {
    match catch_unwind(AssertUnwindSafe(|| provider.begin(readonly))) {
        Ok(Ok(scope)) => Ok(scope),
        Ok(Err(e)) => Err(StreamError::scope(ScopeOperation::Begin, e)),
        Err(payload) => Err(StreamError::scope(
            ScopeOperation::Begin,
            panic_message(payload.as_ref()),
        )),
    }
}

/// Commit, with a panicking commit reported as a commit failure
pub(crate) fn commit<H: ScopeHandle>(scope: H) -> Result<(), StreamError> {
    match catch_unwind(AssertUnwindSafe(move || scope.commit())) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(StreamError::scope(ScopeOperation::Commit, e)),
        Err(payload) => Err(StreamError::scope(
            ScopeOperation::Commit,
            panic_message(payload.as_ref()),
        )),
    }
}

/// Roll back, logging (not propagating) a failure or panic: the abort reason
/// is what the consumer needs to see
pub(crate) fn rollback<H: ScopeHandle>(stream_id: StreamId, scope: H) {
    match catch_unwind(AssertUnwindSafe(move || scope.rollback())) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(%stream_id, error = %e, "Scope rollback failed"),
        Err(payload) => tracing::warn!(
            %stream_id,
            error = %panic_message(payload.as_ref()),
            "Scope rollback panicked"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::Item;
    use crate::memory::{InMemoryScopeProvider, ScopeOutcome};
    use crate::scope::counting::{CountingProvider, CountingScope};
    use std::convert::Infallible;
    use std::sync::atomic::Ordering;

    fn task<F, S>(
        provider: &Arc<InMemoryScopeProvider>,
        queue: &Arc<HandoffQueue<u32>>,
        flush_every: usize,
        supplier: F,
    ) -> ProducerTask<InMemoryScopeProvider, F, u32>
    where
        F: FnOnce(&mut crate::memory::MemoryScope) -> Result<S, Infallible>,
        S: IntoIterator<Item = Result<u32, Infallible>>,
    {
        ProducerTask::new(
            StreamId::new(),
            Arc::clone(provider),
            supplier,
            Arc::clone(queue),
            true,
            FlushPolicy::every(flush_every),
            Arc::new(BridgeStatsAtomic::default()),
        )
    }

    #[test]
    fn test_flush_policy() {
        let mut policy = FlushPolicy::every(3);
        let due: Vec<bool> = (0..7).map(|_| policy.record_item()).collect();
        assert_eq!(due, vec![false, false, true, false, false, true, false]);
        assert_eq!(policy.interval(), 3);

        let mut never = FlushPolicy::never();
        assert!((0..100).all(|_| !never.record_item()));
    }

    #[test]
    fn test_complete_commits_and_ends() {
        let provider = Arc::new(InMemoryScopeProvider::new());
        let queue = Arc::new(HandoffQueue::new(8));

        let outcome = task(&provider, &queue, 2, |_| Ok((0..5).map(Ok))).run();

        assert_eq!(outcome, ProducerOutcome::Completed { produced: 5 });
        let records = provider.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, Some(ScopeOutcome::Committed));
        assert_eq!(records[0].flushes, 2);
        assert!(records[0].readonly);

        let mut values = Vec::new();
        while let Item::Value(v) = queue.take() {
            values.push(v);
        }
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_consumer_close_rolls_back_without_error_marker() {
        let provider = Arc::new(InMemoryScopeProvider::new());
        let queue = Arc::new(HandoffQueue::new(2));
        queue.close_by_consumer();

        let outcome = task(&provider, &queue, 0, |_| Ok((0..100).map(Ok))).run();

        assert_eq!(outcome, ProducerOutcome::ConsumerClosed { produced: 1 });
        assert_eq!(provider.records()[0].outcome, Some(ScopeOutcome::RolledBack));
        assert!(matches!(queue.take(), Item::End));
    }

    #[test]
    fn test_source_error_rolls_back_and_marks() {
        let provider = Arc::new(InMemoryScopeProvider::new());
        let queue: Arc<HandoffQueue<u32>> = Arc::new(HandoffQueue::new(8));

        let outcome = ProducerTask::new(
            StreamId::new(),
            Arc::clone(&provider),
            |_: &mut crate::memory::MemoryScope| {
                Ok::<_, std::io::Error>((0..5).map(|i| {
                    if i == 3 {
                        Err(std::io::Error::new(std::io::ErrorKind::Other, "row 3 unreadable"))
                    } else {
                        Ok(i)
                    }
                }))
            },
            Arc::clone(&queue),
            false,
            FlushPolicy::never(),
            Arc::new(BridgeStatsAtomic::default()),
        )
        .run();

        assert_eq!(outcome, ProducerOutcome::Failed { produced: 3 });
        assert_eq!(provider.records()[0].outcome, Some(ScopeOutcome::RolledBack));

        assert!(matches!(queue.take(), Item::Value(0)));
        assert!(matches!(queue.take(), Item::Value(1)));
        assert!(matches!(queue.take(), Item::Value(2)));
        match queue.take() {
            Item::Failed(StreamError::Supplier(e)) => assert_eq!(e.to_string(), "row 3 unreadable"),
            other => panic!("expected supplier failure, got {other:?}"),
        }
    }

    #[test]
    fn test_begin_failure_reaches_consumer() {
        let provider = Arc::new(InMemoryScopeProvider::new().fail_begin());
        let queue = Arc::new(HandoffQueue::new(8));

        let outcome = task(&provider, &queue, 0, |_| Ok((0..5).map(Ok))).run();

        assert_eq!(outcome, ProducerOutcome::Failed { produced: 0 });
        assert!(provider.records().is_empty());
        assert!(matches!(
            queue.take(),
            Item::Failed(StreamError::Scope {
                operation: ScopeOperation::Begin,
                ..
            })
        ));
    }

    #[test]
    fn test_commit_failure_follows_all_items() {
        let provider = Arc::new(InMemoryScopeProvider::new().fail_commit());
        let queue = Arc::new(HandoffQueue::new(8));

        let outcome = task(&provider, &queue, 0, |_| Ok((0..2).map(Ok))).run();

        assert_eq!(outcome, ProducerOutcome::Failed { produced: 2 });
        assert!(matches!(queue.take(), Item::Value(0)));
        assert!(matches!(queue.take(), Item::Value(1)));
        assert!(matches!(
            queue.take(),
            Item::Failed(StreamError::Scope {
                operation: ScopeOperation::Commit,
                ..
            })
        ));
    }

    #[test]
    fn test_panicking_source_becomes_error() {
        let provider = Arc::new(InMemoryScopeProvider::new());
        let queue = Arc::new(HandoffQueue::new(8));

        let outcome = task(&provider, &queue, 0, |_| {
            Ok((0..5).map(|i| {
                assert!(i < 1, "lazy load outside session");
                Ok(i)
            }))
        })
        .run();

        assert_eq!(outcome, ProducerOutcome::Failed { produced: 1 });
        assert_eq!(provider.records()[0].outcome, Some(ScopeOutcome::RolledBack));
        assert!(matches!(queue.take(), Item::Value(0)));
        match queue.take() {
            Item::Failed(StreamError::ProducerPanicked(msg)) => {
                assert!(msg.contains("lazy load outside session"));
            }
            other => panic!("expected panic marker, got {other:?}"),
        }
    }

    #[test]
    fn test_panicking_commit_reported_as_commit_failure() {
        let provider = Arc::new(CountingProvider {
            panic_on_commit: true,
            ..CountingProvider::default()
        });
        let counts = Arc::clone(&provider.counts);
        let queue = Arc::new(HandoffQueue::new(8));
        let stats = Arc::new(BridgeStatsAtomic::default());

        let outcome = ProducerTask::new(
            StreamId::new(),
            provider,
            |_: &mut CountingScope| Ok::<_, Infallible>((0..2u32).map(Ok)),
            Arc::clone(&queue),
            true,
            FlushPolicy::never(),
            Arc::clone(&stats),
        )
        .run();

        assert_eq!(outcome, ProducerOutcome::Failed { produced: 2 });
        assert_eq!(counts.begins.load(Ordering::SeqCst), 1);
        assert_eq!(counts.rollbacks.load(Ordering::SeqCst), 0);
        assert!(matches!(queue.take(), Item::Value(0)));
        assert!(matches!(queue.take(), Item::Value(1)));
        match queue.take() {
            Item::Failed(StreamError::Scope {
                operation: ScopeOperation::Commit,
                source,
            }) => assert!(source.to_string().contains("commit blew up")),
            other => panic!("expected commit failure, got {other:?}"),
        }
        assert_eq!(stats.snapshot().failed, 1);
    }

    #[test]
    fn test_flushes_counted_on_generic_handle() {
        let provider = Arc::new(CountingProvider::default());
        let counts = Arc::clone(&provider.counts);
        let queue = Arc::new(HandoffQueue::new(16));

        let outcome = ProducerTask::new(
            StreamId::new(),
            provider,
            |_: &mut CountingScope| Ok::<_, Infallible>((0..7u32).map(Ok)),
            Arc::clone(&queue),
            true,
            FlushPolicy::every(3),
            Arc::new(BridgeStatsAtomic::default()),
        )
        .run();

        assert_eq!(outcome, ProducerOutcome::Completed { produced: 7 });
        assert_eq!(counts.flushes.load(Ordering::SeqCst), 2);
        assert_eq!(counts.terminations(), 1);
    }

    #[test]
    fn test_dropped_task_unblocks_consumer() {
        let provider = Arc::new(InMemoryScopeProvider::new());
        let queue = Arc::new(HandoffQueue::new(8));

        drop(task(&provider, &queue, 0, |_| Ok((0..5).map(Ok))));

        assert!(provider.records().is_empty());
        assert!(matches!(queue.take(), Item::Failed(StreamError::PoolClosed)));
    }
}
