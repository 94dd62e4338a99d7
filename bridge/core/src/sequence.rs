//! Consumer-side sequence
//!
//! [`ScopedStream`] is what `stream()` hands back. It pulls from the handoff
//! queue (or from a materialized buffer in fallback mode) and raises a
//! producer failure exactly once, on the pull that reaches it.

use std::iter::FusedIterator;
use std::sync::Arc;

use crate::bridge::StreamId;
use crate::error::StreamError;
use crate::handoff::{HandoffQueue, Item};

enum Source<T> {
    Handoff(Arc<HandoffQueue<T>>),
    Materialized {
        items: std::vec::IntoIter<T>,
        failure: Option<StreamError>,
    },
    Done,
}

/// Lazy, single-use sequence of items produced inside a scope
///
/// Dropping the stream before it is exhausted closes it: the producer stops at
/// its next hand-off and rolls its scope back.
pub struct ScopedStream<T> {
    id: StreamId,
    capacity: usize,
    /// Buffer depth reached, kept once the source is released
    high_water: usize,
    source: Source<T>,
}

impl<T> ScopedStream<T> {
    pub(crate) fn handoff(id: StreamId, queue: Arc<HandoffQueue<T>>) -> Self {
        Self {
            id,
            capacity: queue.capacity(),
            high_water: 0,
            source: Source::Handoff(queue),
        }
    }

    pub(crate) fn materialized(id: StreamId, items: Vec<T>, failure: Option<StreamError>) -> Self {
        Self {
            id,
            capacity: items.len(),
            high_water: items.len(),
            source: Source::Materialized {
                items: items.into_iter(),
                failure,
            },
        }
    }

    /// Identifier used in log output for this stream
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Buffer capacity between producer and consumer
    ///
    /// For a materialized stream this is the number of buffered items.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Most items buffered at once so far
    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        match &self.source {
            Source::Handoff(queue) => queue.high_water_mark(),
            Source::Materialized { .. } | Source::Done => self.high_water,
        }
    }

    /// Whether items arrive from a concurrent producer (as opposed to a
    /// buffer filled synchronously by the fallback)
    #[must_use]
    pub fn is_concurrent(&self) -> bool {
        matches!(self.source, Source::Handoff(_))
    }

    /// Stop consuming
    ///
    /// Idempotent. Buffered items are discarded and the producer is told to
    /// stop; later pulls return `None`.
    pub fn close(&mut self) {
        if let Source::Handoff(queue) = std::mem::replace(&mut self.source, Source::Done) {
            self.high_water = queue.high_water_mark();
            if queue.close_by_consumer() {
                tracing::debug!(stream_id = %self.id, "Consumer closed stream early");
            }
        }
    }
}

impl<T> Iterator for ScopedStream<T> {
    type Item = Result<T, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = match &mut self.source {
            Source::Handoff(queue) => match queue.take() {
                Item::Value(value) => return Some(Ok(value)),
                Item::End => None,
                Item::Failed(error) => Some(Err(error)),
            },
            Source::Materialized { items, failure } => match items.next() {
                Some(value) => return Some(Ok(value)),
                None => failure.take().map(Err),
            },
            Source::Done => return None,
        };

        if let Source::Handoff(queue) = &self.source {
            self.high_water = queue.high_water_mark();
        }
        self.source = Source::Done;
        next
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.source {
            Source::Handoff(_) => (0, None),
            Source::Materialized { items, failure } => {
                let n = items.len() + usize::from(failure.is_some());
                (n, Some(n))
            }
            Source::Done => (0, Some(0)),
        }
    }
}

impl<T> FusedIterator for ScopedStream<T> {}

impl<T> Drop for ScopedStream<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> std::fmt::Debug for ScopedStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match &self.source {
            Source::Handoff(_) => "handoff",
            Source::Materialized { .. } => "materialized",
            Source::Done => "done",
        };
        f.debug_struct("ScopedStream")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("mode", &mode)
            .finish()
    }
}
