//! # Batchwire
//!
//! Batching, coalescing, at-least-once event consumers for expensive
//! background work, plus the relay that feeds them from a transactional
//! outbox.
//!
//! ## Core Concepts
//!
//! Writes never talk to the broker directly:
//! - The business transaction writes an outbox row next to its mutation
//! - The [`OutboxRelay`] publishes pending rows on a fixed interval
//! - [`BatchWorker`]s consume the published events and trigger downstream
//!   work (board summary, chat summary, conversation title)
//!
//! The key principle: **a burst of events triggers the downstream work once,
//! not N times.** Events for the same key inside one flush collapse into one
//! call with the most recently received event.
//!
//! ## Architecture
//!
//! ```text
//! mutation ─► outbox row
//!                │
//!                ▼ OutboxRelay (every 500 ms)
//!             Broker ───────────────────────────────┐
//!                │                                  │
//!                ▼ Subscription::receive            │
//!          DeliverySink (bounded, 2 × batch)        │
//!                │                                  │
//!                ▼ BatchWorker main loop            │
//!       size reached / timer tick                   │
//!                │                                  │
//!                ▼ flush                            │
//!     decode ─► filter ─► coalesce ─► invoke        │
//!       │          │                    │           │
//!      nack       ack            ack / nack ────────┘
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Every delivery is settled once** - acked or nacked by exactly one
//!    stage of the flush, or nacked on shutdown
//! 2. **One call per key per flush** - last received wins, arrival order is
//!    authoritative
//! 3. **Flushes are sequential** - a slow handler is backpressure, not a bug
//! 4. **Only subscription failure is fatal** - everything else is an
//!    ack/nack decision plus a log line
//!
//! ## Guarantees
//!
//! - **At-least-once delivery**: handlers must tolerate duplicates
//! - **Per-key ordering within a flush only**: across flushes a redelivered
//!   stale event may follow a newer one
//!
//! ## Example
//!
//! ```ignore
//! use batchwire::{chat_summary_worker, BatchWorkerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let worker = chat_summary_worker(subscription, summarizer, BatchWorkerConfig::default())?;
//! let cancel = CancellationToken::new();
//!
//! tokio::spawn({
//!     let cancel = cancel.clone();
//!     async move { worker.run(cancel).await }
//! });
//! ```

mod broker;
mod config;
mod envelope;
mod error;
mod handler;
mod relay;
mod worker;
mod workers;

// Flush stages are public so custom loops can reuse them
pub mod flush;

// Re-export broker types
pub use broker::{Delivery, DeliverySink, Publisher, Subscription};

// Re-export configuration
pub use config::{
    BatchWorkerConfig, RelayConfig, DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL, MAX_BATCH_SIZE,
};

// Re-export envelope types
pub use envelope::{ChatRole, EventEnvelope, EventType};

// Re-export error types
pub use error::{is_cancelled, BrokerError, Cancelled, WorkerError};

// Re-export handler strategy
pub use handler::{EventHandler, Routing};

// Re-export relay types
pub use relay::{DispatchPendingOutboxEvents, OutboxRelay};

// Re-export worker types
pub use worker::{BatchWorker, WorkerState, WorkerStats};
pub use workers::{
    board_summary_worker, chat_summary_worker, conversation_title_worker, BoardSummaryHandler,
    ChatSummaryHandler, ConversationTitleHandler, GenerateBoardSummary, GenerateChatSummary,
    GenerateConversationTitle,
};

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
