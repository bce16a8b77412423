//! The strategy a batch worker is parameterized with.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::envelope::EventEnvelope;

/// Where a decoded event goes within a flush.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Routing {
    /// Not an event this worker handles. Acked and dropped.
    Ignore,
    /// Board-level event: the whole batch shares one implicit group.
    Batch,
    /// Keyed event: coalesced with other events for the same key.
    Key(String),
    /// Relevant type, but the key is missing. Acked and dropped.
    Unroutable,
}

/// Filter, key extractor and downstream call for one kind of worker.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Worker name, for logs and errors.
    fn name(&self) -> &'static str;

    /// Decide what to do with a decoded event.
    fn route(&self, event: &EventEnvelope) -> Routing;

    /// Run the downstream use case once for a coalesced group.
    ///
    /// `event` is the last event received for the group's key. Must be safe
    /// to call again for an equivalent event.
    async fn handle(&self, cancel: &CancellationToken, event: &EventEnvelope)
        -> anyhow::Result<()>;
}

#[async_trait]
impl<H: EventHandler + ?Sized> EventHandler for std::sync::Arc<H> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn route(&self, event: &EventEnvelope) -> Routing {
        (**self).route(event)
    }

    async fn handle(
        &self,
        cancel: &CancellationToken,
        event: &EventEnvelope,
    ) -> anyhow::Result<()> {
        (**self).handle(cancel, event).await
    }
}
