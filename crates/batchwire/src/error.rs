//! Error types for the batching pipeline.

use thiserror::Error;

/// Errors raised by a broker subscription or publisher.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The subscription could not be established (missing subscription,
    /// permissions, unreachable broker). Fatal to the worker.
    #[error("subscription `{subscription}` failed to initialize: {reason}")]
    SubscriptionInit {
        subscription: String,
        reason: String,
    },

    /// Someone is already receiving from this subscription.
    #[error("subscription `{0}` is already being received from")]
    AlreadyReceiving(String),

    /// Publishing a payload to a topic failed.
    #[error("publish to topic `{topic}` failed: {reason}")]
    Publish { topic: String, reason: String },

    /// Any other broker-side failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors that terminate a worker's `run`.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The broker subscription failed irrecoverably.
    #[error("worker `{worker}` subscription failed")]
    Subscription {
        worker: &'static str,
        #[source]
        source: BrokerError,
    },

    /// The background receive task panicked or was aborted.
    #[error("worker `{worker}` receive task failed: {reason}")]
    ReceiveTaskFailed { worker: &'static str, reason: String },

    /// The configured subscription name is not the subscription the worker
    /// was given.
    #[error("worker `{worker}` configured for subscription `{configured}` but reads `{actual}`")]
    SubscriptionMismatch {
        worker: &'static str,
        configured: String,
        actual: String,
    },

    /// `run` was called on a worker that is already running or stopped.
    #[error("worker `{0}` was already started")]
    AlreadyStarted(&'static str),
}

/// Marker error a use case can return when it gave up because the run
/// context was cancelled.
///
/// The handler invoker treats it (or any failure observed after
/// cancellation) as the expected shutdown path rather than an anomaly.
#[derive(Debug, Clone, Copy, Default, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Returns `true` if `err` or any of its causes is [`Cancelled`].
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<Cancelled>())
}
