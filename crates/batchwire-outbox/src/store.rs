use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::OutboxEvent;

/// Errors returned by an outbox ledger.
#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("outbox event {0} not found")]
    NotFound(Uuid),

    #[error("outbox payload could not be serialized: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("outbox backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl OutboxError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }
}

/// Retry bookkeeping after a failed publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// Will be fetched again on a later dispatch.
    Retrying { retry_count: i32 },
    /// Reached `max_retries`; no longer fetched.
    Exhausted { retry_count: i32 },
}

/// The durable ledger of pending events.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Store a new event.
    async fn insert(&self, event: OutboxEvent) -> Result<(), OutboxError>;

    /// Oldest events with publish attempts left, at most `limit`.
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxError>;

    /// Remove an event after a confirmed publish.
    async fn delete(&self, id: Uuid) -> Result<(), OutboxError>;

    /// Bump the retry count and remember the error.
    async fn record_failure(&self, id: Uuid, error: &str) -> Result<RetryState, OutboxError>;
}

#[async_trait]
impl<T: OutboxStore + ?Sized> OutboxStore for std::sync::Arc<T> {
    async fn insert(&self, event: OutboxEvent) -> Result<(), OutboxError> {
        (**self).insert(event).await
    }

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxError> {
        (**self).fetch_pending(limit).await
    }

    async fn delete(&self, id: Uuid) -> Result<(), OutboxError> {
        (**self).delete(id).await
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<RetryState, OutboxError> {
        (**self).record_failure(id, error).await
    }
}
