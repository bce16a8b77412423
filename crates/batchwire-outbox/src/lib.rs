//! Transactional outbox for Batchwire.
//!
//! The write path stores an [`OutboxEvent`] in the same transaction as the
//! business mutation. The [`OutboxDispatcher`] is the use case the
//! [`batchwire::OutboxRelay`] drives: it publishes pending events to the
//! broker and removes them from the ledger once the publish is confirmed.
//!
//! # Guarantees
//!
//! - An event leaves the ledger only after a successful publish
//! - A failed publish bumps `retry_count` and records `last_error`
//! - Events at `max_retries` stop being fetched (they stay in the ledger
//!   for operators to inspect)
//! - A delete failing after a successful publish means the event is
//!   published again on the next tick: delivery is at-least-once

mod dispatch;
mod event;
mod memory;
mod store;

pub use dispatch::OutboxDispatcher;
pub use event::OutboxEvent;
pub use memory::InMemoryOutboxStore;
pub use store::{OutboxError, OutboxStore, RetryState};
