//! Bounded Handoff Between Producer and Consumer
//!
//! One [`HandoffQueue`] is created per streaming call and shared by exactly
//! two parties: the producer running on a worker thread and the consumer
//! pulling from a [`ScopedStream`](crate::sequence::ScopedStream).
//!
//! # Protocol
//!
//! ```text
//!   producer (worker)                         consumer (caller)
//!   ─────────────────                         ─────────────────
//!   put(item) ──► [ v1 | v2 | ... | vC ] ──► take() -> Item::Value
//!      │  blocks while full                      │  blocks while empty
//!      │                                         │
//!   close_by_producer(None | Some(err)) ───────► take() -> Item::End / Item::Failed
//!                                                │
//!   put(..) -> Err(ConsumerClosed) ◄──────────── close_by_consumer()
//! ```
//!
//! - Delivery is strict FIFO.
//! - At most one terminal marker is ever produced, and it is handed out once.
//! - Closing by the consumer discards buffered items and wakes a blocked
//!   producer so it can abort promptly.

mod queue;

pub use queue::{ConsumerClosed, HandoffQueue, Item, QueueState};
