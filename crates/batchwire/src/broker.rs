//! Broker capability traits and the queue boundary between a push-based
//! subscription and the pull-based batch loop.
//!
//! A broker hands each message to a callback and expects the callback to
//! eventually `ack` or `nack` it. [`DeliverySink`] is that callback: it moves
//! the delivery onto a bounded queue owned by the worker, blocking the
//! broker's delivery loop while the queue is full.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::BrokerError;

/// One delivered broker message.
///
/// `ack` and `nack` are idempotent and mutually exclusive: whichever is
/// called first wins, later calls are no-ops.
pub trait Delivery: Send + 'static {
    /// Broker-assigned message id, used for logging only.
    fn id(&self) -> &str;

    /// Raw payload bytes.
    fn payload(&self) -> &[u8];

    /// Mark the message as processed. It will not be redelivered.
    fn ack(&self);

    /// Reject the message so the broker redelivers it.
    fn nack(&self);
}

/// A subscription that pushes deliveries into a [`DeliverySink`].
#[async_trait]
pub trait Subscription: Send + Sync + 'static {
    type Delivery: Delivery;

    /// Subscription identifier, for logs.
    fn name(&self) -> &str;

    /// Receive until `cancel` fires or the subscription fails.
    ///
    /// Returns `Ok(())` on cancellation. An `Err` means the subscription
    /// could not be set up or broke irrecoverably.
    async fn receive(
        &self,
        cancel: CancellationToken,
        sink: DeliverySink<Self::Delivery>,
    ) -> Result<(), BrokerError>;
}

/// Publishes raw payloads to a topic.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError>;
}

/// Sending half of a worker's bounded delivery queue.
pub struct DeliverySink<D> {
    tx: mpsc::Sender<D>,
    cancel: CancellationToken,
}

impl<D> Clone for DeliverySink<D> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<D: Delivery> DeliverySink<D> {
    /// Create a sink and the matching receiver, with room for `capacity`
    /// deliveries.
    pub fn channel(capacity: usize, cancel: CancellationToken) -> (Self, mpsc::Receiver<D>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, cancel }, rx)
    }

    /// Hand a delivery to the worker.
    ///
    /// Waits while the queue is full. If the run context is cancelled while
    /// waiting, or the worker has stopped, the delivery is nacked and
    /// dropped. Returns whether the delivery was enqueued.
    pub async fn deliver(&self, delivery: D) -> bool {
        tokio::select! {
            biased;
            permit = self.tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(delivery);
                    true
                }
                Err(_) => {
                    delivery.nack();
                    false
                }
            },
            _ = self.cancel.cancelled() => {
                tracing::debug!(message_id = delivery.id(), "worker cancelled, nacking undelivered message");
                delivery.nack();
                false
            }
        }
    }

    /// Whether the worker side of the queue is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
