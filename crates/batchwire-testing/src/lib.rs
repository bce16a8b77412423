//! Testing utilities for Batchwire.
//!
//! - [`InMemoryBroker`]: topics, named subscriptions, an ack/nack ledger per
//!   subscription and optional redelivery of nacked messages
//! - [`FailingSubscription`]: a subscription that never comes up
//! - [`Recorder`]: a use case for all three workers that records calls,
//!   can fail or stall on demand, and keeps an idempotent effect store

mod broker;
mod recorder;

pub use broker::{
    FailingSubscription, InMemoryBroker, InMemoryDelivery, InMemorySubscription, Outcome,
    Settlement,
};
pub use recorder::{Call, Recorder};
