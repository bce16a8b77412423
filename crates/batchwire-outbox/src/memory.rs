use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::{OutboxError, OutboxEvent, OutboxStore, RetryState};

/// In-memory outbox ledger for tests and local pipelines.
///
/// Events are fetched in insertion order.
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    events: Arc<DashMap<Uuid, (u64, OutboxEvent)>>,
    sequence: Arc<AtomicU64>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<OutboxEvent> {
        self.events.get(&id).map(|entry| entry.1.clone())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(&self, event: OutboxEvent) -> Result<(), OutboxError> {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.events.insert(event.id, (seq, event));
        Ok(())
    }

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxError> {
        let mut pending: Vec<(u64, OutboxEvent)> = self
            .events
            .iter()
            .filter(|entry| !entry.1.is_exhausted())
            .map(|entry| entry.value().clone())
            .collect();
        pending.sort_by_key(|(seq, _)| *seq);

        Ok(pending
            .into_iter()
            .take(limit)
            .map(|(_, event)| event)
            .collect())
    }

    async fn delete(&self, id: Uuid) -> Result<(), OutboxError> {
        self.events
            .remove(&id)
            .map(|_| ())
            .ok_or(OutboxError::NotFound(id))
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<RetryState, OutboxError> {
        let mut entry = self.events.get_mut(&id).ok_or(OutboxError::NotFound(id))?;
        let event = &mut entry.1;
        event.retry_count += 1;
        event.last_error = Some(error.to_string());

        Ok(if event.is_exhausted() {
            RetryState::Exhausted {
                retry_count: event.retry_count,
            }
        } else {
            RetryState::Retrying {
                retry_count: event.retry_count,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: u32) -> OutboxEvent {
        OutboxEvent::new(
            "todo",
            n.to_string(),
            "todos",
            "todo_created",
            serde_json::json!({ "type": "todo_created" }),
        )
    }

    #[tokio::test]
    async fn fetches_in_insertion_order_up_to_limit() {
        let store = InMemoryOutboxStore::new();
        for n in 0..5 {
            store.insert(event(n)).await.unwrap();
        }

        let pending = store.fetch_pending(3).await.unwrap();

        let ids: Vec<_> = pending.iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn exhausted_events_are_no_longer_fetched() {
        let store = InMemoryOutboxStore::new();
        let e = event(1).with_max_retries(2);
        let id = e.id;
        store.insert(e).await.unwrap();

        assert_eq!(
            store.record_failure(id, "broker down").await.unwrap(),
            RetryState::Retrying { retry_count: 1 }
        );
        assert_eq!(
            store.record_failure(id, "broker still down").await.unwrap(),
            RetryState::Exhausted { retry_count: 2 }
        );

        assert!(store.fetch_pending(10).await.unwrap().is_empty());
        let kept = store.get(id).unwrap();
        assert_eq!(kept.last_error.as_deref(), Some("broker still down"));
    }

    #[tokio::test]
    async fn deleting_unknown_event_fails() {
        let store = InMemoryOutboxStore::new();
        let id = Uuid::new_v4();
        assert!(matches!(store.delete(id).await, Err(OutboxError::NotFound(missing)) if missing == id));
    }
}
