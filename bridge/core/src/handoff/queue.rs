//! Handoff Queue Implementation

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::error::StreamError;

// ============================================================================
// Items and State
// ============================================================================

/// What the consumer receives from [`HandoffQueue::take`]
#[derive(Debug)]
pub enum Item<T> {
    /// A produced value
    Value(T),
    /// The producer finished normally
    End,
    /// The producer aborted with an error
    Failed(StreamError),
}

impl<T> Item<T> {
    /// Whether this item is a terminal marker
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Value(_))
    }
}

/// Lifecycle of a handoff queue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueState {
    /// Both sides active
    Open,
    /// The consumer stopped pulling; puts fail fast
    ClosedByConsumer,
    /// The producer is done; no further items will arrive
    ClosedByProducer,
}

/// Returned by [`HandoffQueue::put`] once the consumer has closed the queue
///
/// This is the normal early-termination signal, not a failure.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("consumer closed the stream")]
pub struct ConsumerClosed;

// ============================================================================
// Handoff Queue
// ============================================================================

struct Inner<T> {
    items: VecDeque<T>,
    state: QueueState,
    /// Error terminal, present until handed to the consumer
    failure: Option<StreamError>,
    /// Deepest the buffer has been
    high_water_mark: usize,
}

/// Bounded single-producer/single-consumer buffer with a terminal marker
pub struct HandoffQueue<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
    /// Signalled when an item or terminal marker becomes available
    not_empty: Condvar,
    /// Signalled when space frees up or the consumer closes
    not_full: Condvar,
}

impl<T> HandoffQueue<T> {
    /// Create a queue holding at most `capacity` items (clamped to at least 1)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                state: QueueState::Open,
                failure: None,
                high_water_mark: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Fixed capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> QueueState {
        self.inner.lock().state
    }

    /// Number of buffered, unconsumed items
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether no items are buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Largest number of unconsumed items ever buffered at once
    #[must_use]
    pub fn high_water_mark(&self) -> usize {
        self.inner.lock().high_water_mark
    }

    /// Hand one item to the consumer
    ///
    /// Blocks while the buffer is full and the queue is open. Fails with
    /// [`ConsumerClosed`] as soon as the consumer has closed the queue; the
    /// item is dropped in that case.
    pub fn put(&self, item: T) -> Result<(), ConsumerClosed> {
        let mut inner = self.inner.lock();
        loop {
            match inner.state {
                QueueState::ClosedByConsumer => return Err(ConsumerClosed),
                // Nobody will read past the terminal marker
                QueueState::ClosedByProducer => return Err(ConsumerClosed),
                QueueState::Open if inner.items.len() < self.capacity => break,
                QueueState::Open => self.not_full.wait(&mut inner),
            }
        }

        inner.items.push_back(item);
        inner.high_water_mark = inner.high_water_mark.max(inner.items.len());
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Take the next item or terminal marker
    ///
    /// Blocks while the buffer is empty and the queue is open. Buffered items
    /// are drained before the terminal marker. An error marker is returned
    /// once; later calls see [`Item::End`].
    pub fn take(&self) -> Item<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Item::Value(item);
            }

            match inner.state {
                QueueState::Open => self.not_empty.wait(&mut inner),
                QueueState::ClosedByProducer => {
                    return match inner.failure.take() {
                        Some(error) => Item::Failed(error),
                        None => Item::End,
                    };
                }
                QueueState::ClosedByConsumer => return Item::End,
            }
        }
    }

    /// Mark the end of production, optionally with an error
    ///
    /// Idempotent: only the first call on an open queue has an effect. A
    /// queue already closed by the consumer stays closed and the error is
    /// dropped, since nobody is left to observe it.
    ///
    /// Returns `true` if this call closed the queue.
    pub fn close_by_producer(&self, error: Option<StreamError>) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != QueueState::Open {
            return false;
        }
        inner.state = QueueState::ClosedByProducer;
        inner.failure = error;
        drop(inner);
        self.not_empty.notify_all();
        true
    }

    /// Stop consuming
    ///
    /// Idempotent. Buffered items are discarded immediately and a producer
    /// blocked in [`put`](Self::put) wakes up with [`ConsumerClosed`].
    ///
    /// Returns `true` if the producer was still active when the consumer
    /// closed.
    pub fn close_by_consumer(&self) -> bool {
        let mut inner = self.inner.lock();
        let was_open = inner.state == QueueState::Open;
        if was_open {
            inner.state = QueueState::ClosedByConsumer;
        }
        let discarded = std::mem::take(&mut inner.items);
        inner.failure = None;
        drop(inner);
        // Dropped outside the lock
        drop(discarded);
        self.not_full.notify_all();
        self.not_empty.notify_all();
        was_open
    }
}

impl<T> std::fmt::Debug for HandoffQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("HandoffQueue")
            .field("capacity", &self.capacity)
            .field("len", &inner.items.len())
            .field("state", &inner.state)
            .field("high_water_mark", &inner.high_water_mark)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
