use anyhow::Context as _;
use async_trait::async_trait;
use batchwire::{CancellationToken, DispatchPendingOutboxEvents, Publisher};
use tracing::{debug, error, warn};

use crate::{OutboxEvent, OutboxStore, RetryState};

/// Publishes pending outbox events and clears them from the ledger.
///
/// This is the use case behind [`batchwire::OutboxRelay`]: each call
/// handles at most `batch_limit` events, oldest first.
pub struct OutboxDispatcher<S, P> {
    store: S,
    publisher: P,
    batch_limit: usize,
}

impl<S, P> OutboxDispatcher<S, P>
where
    S: OutboxStore,
    P: Publisher,
{
    pub const DEFAULT_BATCH_LIMIT: usize = 100;

    pub fn new(store: S, publisher: P) -> Self {
        Self {
            store,
            publisher,
            batch_limit: Self::DEFAULT_BATCH_LIMIT,
        }
    }

    pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    async fn publish(&self, event: &OutboxEvent) -> anyhow::Result<()> {
        let payload = event.payload_bytes()?;
        self.publisher.publish(&event.topic, &payload).await?;
        Ok(())
    }

    async fn record_failure(&self, event: &OutboxEvent, err: &anyhow::Error) {
        match self.store.record_failure(event.id, &format!("{err:#}")).await {
            Ok(RetryState::Retrying { retry_count }) => warn!(
                event_id = %event.id,
                topic = %event.topic,
                retry_count,
                error = %err,
                "outbox publish failed, will retry"
            ),
            Ok(RetryState::Exhausted { retry_count }) => error!(
                event_id = %event.id,
                topic = %event.topic,
                retry_count,
                error = %err,
                "outbox publish failed, retries exhausted"
            ),
            Err(store_err) => error!(
                event_id = %event.id,
                error = %store_err,
                "failed to record outbox publish failure"
            ),
        }
    }
}

#[async_trait]
impl<S, P> DispatchPendingOutboxEvents for OutboxDispatcher<S, P>
where
    S: OutboxStore,
    P: Publisher,
{
    async fn dispatch_pending_outbox_events(
        &self,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let events = self
            .store
            .fetch_pending(self.batch_limit)
            .await
            .context("fetching pending outbox events")?;
        if events.is_empty() {
            return Ok(());
        }

        let total = events.len();
        let mut published = 0usize;
        let mut failed = 0usize;

        for event in &events {
            if cancel.is_cancelled() {
                break;
            }

            match self.publish(event).await {
                Ok(()) => {
                    published += 1;
                    if let Err(err) = self.store.delete(event.id).await {
                        // Published but still in the ledger: it will go out again.
                        failed += 1;
                        error!(event_id = %event.id, error = %err, "failed to delete published outbox event");
                    }
                }
                Err(err) => {
                    failed += 1;
                    self.record_failure(event, &err).await;
                }
            }
        }

        debug!(total, published, failed, "dispatched outbox events");

        if failed > 0 {
            anyhow::bail!("{failed} of {total} outbox events failed to dispatch");
        }
        Ok(())
    }
}
