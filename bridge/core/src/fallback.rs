//! Synchronous fallback
//!
//! Used when streaming is disabled or when `stream()` is called from inside a
//! producer. The source is drained completely on the calling thread, inside
//! one scope, and the caller gets a sequence over the buffered items. No
//! handoff, no worker.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::bridge::{BridgeStatsAtomic, StreamId};
use crate::error::{BoxError, StreamError};
use crate::producer::{self, FlushPolicy};
use crate::scope::{ScopeHandle, ScopeOperation, ScopeProvider};
use crate::sequence::ScopedStream;

/// Items and flushes collected by [`materialize`]
#[derive(Debug)]
pub struct Materialized<T> {
    /// Items taken from the source, in order
    pub items: Vec<T>,
    /// Flushes that succeeded
    pub flushes: u64,
}

impl<T> Default for Materialized<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            flushes: 0,
        }
    }
}

/// Drain a supplier's sequence into `buffer` inside an already open scope
///
/// Items produced before a failure stay in the buffer, so they survive an
/// unwind out of the source as well. The scope is left open; the caller
/// decides how to terminate it.
///
/// # Errors
///
/// [`StreamError::Supplier`] when the supplier or the source fails,
/// [`StreamError::Scope`] when a periodic flush fails.
pub fn materialize<H, F, S, T, E>(
    scope: &mut H,
    supplier: F,
    flush: FlushPolicy,
    buffer: &mut Materialized<T>,
) -> Result<(), StreamError>
where
    H: ScopeHandle,
    F: FnOnce(&mut H) -> Result<S, E>,
    S: IntoIterator<Item = Result<T, E>>,
    E: Into<BoxError>,
{
    let mut flush = flush;
    let source = supplier(scope).map_err(StreamError::supplier)?;

    for item in source {
        buffer.items.push(item.map_err(StreamError::supplier)?);
        if flush.record_item() {
            scope
                .flush()
                .map_err(|e| StreamError::scope(ScopeOperation::Flush, e))?;
            buffer.flushes += 1;
        }
    }

    Ok(())
}

/// Acquire a scope on the calling thread, materialize, and terminate
///
/// A panicking supplier or source is contained here the same way the worker
/// contains it: the scope is rolled back and the stream ends in
/// [`StreamError::ProducerPanicked`] after the items produced so far.
pub(crate) fn run_fallback<P, F, S, T, E>(
    stream_id: StreamId,
    provider: &P,
    readonly: bool,
    supplier: F,
    flush: FlushPolicy,
    stats: &BridgeStatsAtomic,
) -> ScopedStream<T>
where
    P: ScopeProvider,
    F: FnOnce(&mut P::Handle) -> Result<S, E>,
    S: IntoIterator<Item = Result<T, E>>,
    E: Into<BoxError>,
{
    let mut scope = match producer::begin(provider, readonly) {
        Ok(scope) => scope,
        Err(error) => {
            tracing::warn!(%stream_id, error = %error, "Scope acquisition failed");
            stats.record_failed(0, 0);
            return ScopedStream::materialized(stream_id, Vec::new(), Some(error));
        }
    };

    let mut buffer = Materialized::default();
    let drained = catch_unwind(AssertUnwindSafe(|| {
        materialize(&mut scope, supplier, flush, &mut buffer)
    }));
    let failure = match drained {
        Ok(result) => result.err(),
        Err(payload) => {
            let error = StreamError::from_panic(payload.as_ref());
            tracing::error!(%stream_id, error = %error, "Supplier panicked on the calling thread");
            Some(error)
        }
    };

    let Materialized { items, flushes } = buffer;
    let produced = items.len() as u64;

    let failure = match failure {
        None => match producer::commit(scope) {
            Ok(()) => {
                tracing::debug!(%stream_id, produced, "Materialized stream, scope committed");
                stats.record_completed(produced, flushes);
                None
            }
            Err(error) => {
                tracing::warn!(%stream_id, error = %error, "Scope commit failed");
                stats.record_failed(produced, flushes);
                Some(error)
            }
        },
        Some(error) => {
            tracing::warn!(%stream_id, produced, error = %error, "Materialization failed, rolling back scope");
            producer::rollback(stream_id, scope);
            stats.record_failed(produced, flushes);
            Some(error)
        }
    };

    ScopedStream::materialized(stream_id, items, failure)
}
