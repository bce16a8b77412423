//! Batch worker: bridges a push subscription into size- or time-triggered
//! flushes.
//!
//! ```text
//!  broker ──► receive task ──► bounded queue (2 × batch size) ──┐
//!                                                               ▼
//!                      cancel / receive-task exit / message / tick
//!                                                               │
//!                                                          main loop
//!                                                               │
//!                                         flush: decode ─► coalesce ─► invoke
//! ```
//!
//! The main loop services one event source per iteration, so a flush never
//! overlaps the next batch's accumulation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Delivery, DeliverySink, Subscription};
use crate::config::BatchWorkerConfig;
use crate::error::{BrokerError, WorkerError};
use crate::flush::{flush, FlushReport};
use crate::handler::EventHandler;

/// How long the receive task may take to stop after the loop exits.
const RECEIVE_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of a worker. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Stopped,
}

/// Running totals over every flush of a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub flushes: u64,
    pub messages: u64,
    pub groups: u64,
    pub failed_groups: u64,
    pub last: FlushReport,
}

impl WorkerStats {
    fn record(&mut self, report: &FlushReport) {
        self.flushes += 1;
        self.messages += report.received as u64;
        self.groups += report.groups as u64;
        self.failed_groups += report.failed as u64;
        self.last = *report;
    }
}

/// A batching consumer for one subscription.
pub struct BatchWorker<S, H> {
    subscription: Arc<S>,
    handler: Arc<H>,
    config: BatchWorkerConfig,
    state: watch::Sender<WorkerState>,
    stats: watch::Sender<WorkerStats>,
}

impl<S, H> BatchWorker<S, H>
where
    S: Subscription,
    H: EventHandler,
{
    /// Create a worker reading `subscription`.
    ///
    /// Zero size/interval fall back to the crate defaults; apply a worker's
    /// own defaults with [`BatchWorkerConfig::normalized`] first. An empty
    /// `config.subscription` takes the subscription's name, any other name
    /// must match it.
    pub fn new(
        subscription: S,
        handler: H,
        config: BatchWorkerConfig,
    ) -> Result<Self, WorkerError> {
        Self::from_arcs(Arc::new(subscription), Arc::new(handler), config)
    }

    pub fn from_arcs(
        subscription: Arc<S>,
        handler: Arc<H>,
        config: BatchWorkerConfig,
    ) -> Result<Self, WorkerError> {
        let config = config
            .normalized(&BatchWorkerConfig::default())
            .bound_to(subscription.name())
            .map_err(|configured| WorkerError::SubscriptionMismatch {
                worker: handler.name(),
                configured,
                actual: subscription.name().to_string(),
            })?;

        let (state, _) = watch::channel(WorkerState::Idle);
        let (stats, _) = watch::channel(WorkerStats::default());
        Ok(Self {
            subscription,
            handler,
            config,
            state,
            stats,
        })
    }

    pub fn config(&self) -> &BatchWorkerConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> WorkerStats {
        *self.stats.borrow()
    }

    /// Watch flush totals; updated after every flush.
    pub fn watch_stats(&self) -> watch::Receiver<WorkerStats> {
        self.stats.subscribe()
    }

    /// Run until `cancel` fires or the subscription fails.
    ///
    /// Returns `Ok(())` on cancellation. A worker runs at most once.
    #[tracing::instrument(
        skip_all,
        fields(worker = self.handler.name(), subscription = %self.config.subscription)
    )]
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), WorkerError> {
        let name = self.handler.name();
        let started = self.state.send_if_modified(|state| {
            if *state == WorkerState::Idle {
                *state = WorkerState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(WorkerError::AlreadyStarted(name));
        }

        info!(
            batch_size = self.config.batch_size,
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            "batch worker started"
        );

        let (sink, queue) = DeliverySink::channel(self.config.queue_capacity(), cancel.clone());
        let receive_task = {
            let subscription = Arc::clone(&self.subscription);
            let cancel = cancel.clone();
            tokio::spawn(async move { subscription.receive(cancel, sink).await })
        };

        let result = self.main_loop(&cancel, queue, receive_task).await;

        self.state.send_replace(WorkerState::Stopped);
        match &result {
            Ok(()) => info!("batch worker stopped"),
            Err(err) => error!(error = %err, "batch worker terminated"),
        }
        result
    }

    async fn main_loop(
        &self,
        cancel: &CancellationToken,
        mut queue: mpsc::Receiver<S::Delivery>,
        mut receive_task: JoinHandle<Result<(), BrokerError>>,
    ) -> Result<(), WorkerError> {
        let name = self.handler.name();
        let mut batch: Vec<S::Delivery> = Vec::new();
        let mut receiving = true;

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.flush_interval,
            self.config.flush_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let outcome = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break Ok(()),

                joined = &mut receive_task, if receiving => {
                    receiving = false;
                    match joined {
                        Ok(Ok(())) if cancel.is_cancelled() => break Ok(()),
                        Ok(Ok(())) => {
                            warn!("subscription stopped delivering before shutdown");
                        }
                        Ok(Err(source)) => {
                            break Err(WorkerError::Subscription { worker: name, source });
                        }
                        Err(join_err) => {
                            break Err(WorkerError::ReceiveTaskFailed {
                                worker: name,
                                reason: join_err.to_string(),
                            });
                        }
                    }
                }

                Some(delivery) = queue.recv() => {
                    batch.push(delivery);
                    if batch.len() >= self.config.batch_size {
                        self.flush_batch(cancel, &mut batch, "size").await;
                    }
                }

                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.flush_batch(cancel, &mut batch, "interval").await;
                    }
                }
            }
        };

        self.shut_down(&mut queue, batch, receiving, receive_task).await;
        outcome
    }

    async fn flush_batch(
        &self,
        cancel: &CancellationToken,
        batch: &mut Vec<S::Delivery>,
        trigger: &'static str,
    ) -> FlushReport {
        let taken = std::mem::take(batch);
        debug!(trigger, size = taken.len(), "flushing batch");
        let report = flush(self.handler.as_ref(), cancel, taken).await;
        self.stats.send_modify(|stats| stats.record(&report));
        report
    }

    /// Release everything that was received but never flushed, then give
    /// the receive task a bounded window to observe cancellation.
    async fn shut_down(
        &self,
        queue: &mut mpsc::Receiver<S::Delivery>,
        batch: Vec<S::Delivery>,
        receiving: bool,
        receive_task: JoinHandle<Result<(), BrokerError>>,
    ) {
        let released = release_unflushed(queue, batch).await;
        if released > 0 {
            debug!(released, "nacked unflushed messages on shutdown");
        }

        if !receiving {
            return;
        }
        let abort = receive_task.abort_handle();
        match tokio::time::timeout(RECEIVE_SHUTDOWN_GRACE, receive_task).await {
            Ok(Ok(Err(err))) => debug!(error = %err, "subscription ended with error during shutdown"),
            Ok(_) => {}
            Err(_) => {
                warn!("receive task did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

/// Close the queue and nack everything batched or still queued.
///
/// Senders holding a reserved slot may still send after `close`, so the
/// queue is drained with `recv` until it reports `None`.
async fn release_unflushed<D: Delivery>(queue: &mut mpsc::Receiver<D>, batch: Vec<D>) -> usize {
    queue.close();
    let mut released = 0usize;
    for delivery in batch {
        delivery.nack();
        released += 1;
    }
    while let Some(delivery) = queue.recv().await {
        delivery.nack();
        released += 1;
    }
    released
}
