//! Outbox relay: drives the "dispatch pending outbox events" use case on a
//! fixed interval.
//!
//! The relay keeps no state beyond its timer. A failed dispatch is logged and
//! retried on the next tick; retry bookkeeping lives with the ledger.

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::RelayConfig;

/// Publishes whatever the outbox ledger holds. Must be idempotent.
#[async_trait]
pub trait DispatchPendingOutboxEvents: Send + Sync {
    async fn dispatch_pending_outbox_events(&self, cancel: &CancellationToken)
        -> anyhow::Result<()>;
}

#[async_trait]
impl<T: DispatchPendingOutboxEvents + ?Sized> DispatchPendingOutboxEvents for std::sync::Arc<T> {
    async fn dispatch_pending_outbox_events(
        &self,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        (**self).dispatch_pending_outbox_events(cancel).await
    }
}

pub struct OutboxRelay<U> {
    use_case: U,
    config: RelayConfig,
}

impl<U: DispatchPendingOutboxEvents> OutboxRelay<U> {
    pub fn new(use_case: U, config: RelayConfig) -> Self {
        Self {
            use_case,
            config: config.normalized(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Tick until cancelled. Dispatch errors never stop the relay.
    #[tracing::instrument(skip_all, fields(worker = "outbox_relay"))]
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "outbox relay started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.use_case.dispatch_pending_outbox_events(&cancel).await {
                        if !cancel.is_cancelled() {
                            error!(error = ?err, "failed to dispatch outbox events");
                        }
                    }
                }
            }
        }

        info!("outbox relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    /// Fails every other call.
    #[derive(Default)]
    struct FlakyDispatch {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DispatchPendingOutboxEvents for FlakyDispatch {
        async fn dispatch_pending_outbox_events(
            &self,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n % 2 == 0 {
                anyhow::bail!("database unavailable");
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_ticking_through_failures() {
        let dispatch = Arc::new(FlakyDispatch::default());
        let relay = OutboxRelay::new(Arc::clone(&dispatch), RelayConfig::default());
        let cancel = CancellationToken::new();

        let running = {
            let cancel = cancel.clone();
            tokio::spawn(async move { relay.run(cancel).await })
        };

        // Ticks at 0, 500, 1000, 1500 ms.
        tokio::time::sleep(Duration::from_millis(1_750)).await;
        cancel.cancel();
        running.await.unwrap();

        assert_eq!(dispatch.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_immediately_when_already_cancelled() {
        let dispatch = Arc::new(FlakyDispatch::default());
        let relay = OutboxRelay::new(Arc::clone(&dispatch), RelayConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        relay.run(cancel).await;

        assert_eq!(dispatch.calls.load(Ordering::SeqCst), 0);
    }
}
