use batchwire::EventEnvelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One durable fact waiting to be published.
///
/// Immutable once written, apart from the retry bookkeeping
/// (`retry_count`, `last_error`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub topic: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    pub const DEFAULT_MAX_RETRIES: i32 = 5;

    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        topic: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            topic: topic.into(),
            event_type: event_type.into(),
            payload,
            retry_count: 0,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// Outbox row carrying an [`EventEnvelope`] as its payload.
    pub fn from_envelope(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        topic: impl Into<String>,
        envelope: &EventEnvelope,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_value(envelope)?;
        Ok(Self::new(
            entity_type,
            entity_id,
            topic,
            envelope.event_type.as_str(),
            payload,
        ))
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// No publish attempts left.
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Payload bytes as published to the broker.
    pub fn payload_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.payload)
    }
}
