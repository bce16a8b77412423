use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use batchwire::{
    BrokerError, CancellationToken, Delivery, DeliverySink, EventEnvelope, Publisher, Subscription,
};
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    Nacked,
}

/// One entry of a subscription's ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub message_id: String,
    pub attempt: u32,
    pub outcome: Outcome,
}

struct Pending {
    id: String,
    payload: Arc<[u8]>,
    attempt: u32,
}

struct SubscriptionState {
    name: String,
    tx: mpsc::UnboundedSender<Pending>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Pending>>>,
    ledger: Mutex<Vec<Settlement>>,
    settled: watch::Sender<usize>,
    max_attempts: u32,
}

impl SubscriptionState {
    fn settle(&self, delivery: &InMemoryDelivery, outcome: Outcome) {
        self.ledger.lock().unwrap().push(Settlement {
            message_id: delivery.id.clone(),
            attempt: delivery.attempt,
            outcome,
        });
        self.settled.send_modify(|count| *count += 1);

        if outcome == Outcome::Nacked && delivery.attempt < self.max_attempts {
            let _ = self.tx.send(Pending {
                id: delivery.id.clone(),
                payload: Arc::clone(&delivery.payload),
                attempt: delivery.attempt + 1,
            });
        }
    }
}

/// In-memory topic/subscription broker.
///
/// Every subscription bound to a topic gets its own copy of each published
/// message. Nacked messages are redelivered until they reach the
/// subscription's attempt limit (1 = no redelivery).
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    topics: Arc<DashMap<String, Vec<Arc<SubscriptionState>>>>,
    subscriptions: Arc<DashMap<String, Arc<SubscriptionState>>>,
    published: Arc<DashMap<String, Vec<Vec<u8>>>>,
    next_id: Arc<AtomicU64>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a subscription to a topic, without redelivery.
    pub fn subscribe(&self, topic: &str, subscription: &str) -> InMemorySubscription {
        self.subscribe_with_redelivery(topic, subscription, 1)
    }

    /// Bind a subscription that redelivers nacked messages until they have
    /// been delivered `max_attempts` times.
    pub fn subscribe_with_redelivery(
        &self,
        topic: &str,
        subscription: &str,
        max_attempts: u32,
    ) -> InMemorySubscription {
        let state = self
            .subscriptions
            .entry(subscription.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let (settled, _) = watch::channel(0);
                let state = Arc::new(SubscriptionState {
                    name: subscription.to_string(),
                    tx,
                    rx: Mutex::new(Some(rx)),
                    ledger: Mutex::new(Vec::new()),
                    settled,
                    max_attempts: max_attempts.max(1),
                });
                self.topics
                    .entry(topic.to_string())
                    .or_default()
                    .push(Arc::clone(&state));
                state
            })
            .clone();

        InMemorySubscription { state }
    }

    /// Publish raw bytes, returning the message id.
    pub fn publish_bytes(&self, topic: &str, payload: impl Into<Vec<u8>>) -> String {
        let payload: Vec<u8> = payload.into();
        let id = format!("msg-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let shared: Arc<[u8]> = Arc::from(payload.clone());

        if let Some(subscriptions) = self.topics.get(topic) {
            for state in subscriptions.iter() {
                let _ = state.tx.send(Pending {
                    id: id.clone(),
                    payload: Arc::clone(&shared),
                    attempt: 1,
                });
            }
        }
        self.published
            .entry(topic.to_string())
            .or_default()
            .push(payload);
        id
    }

    pub fn publish_envelope(&self, topic: &str, envelope: &EventEnvelope) -> String {
        let payload = serde_json::to_vec(envelope).expect("envelope serializes");
        self.publish_bytes(topic, payload)
    }

    /// Everything ever published to `topic`.
    pub fn published(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published
            .get(topic)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    /// The ack/nack ledger of a subscription, in settlement order.
    pub fn settlements(&self, subscription: &str) -> Vec<Settlement> {
        self.subscriptions
            .get(subscription)
            .map(|state| state.ledger.lock().unwrap().clone())
            .unwrap_or_default()
    }

    pub fn outcome_of(&self, subscription: &str, message_id: &str) -> Vec<Outcome> {
        self.settlements(subscription)
            .into_iter()
            .filter(|s| s.message_id == message_id)
            .map(|s| s.outcome)
            .collect()
    }

    pub fn acked(&self, subscription: &str) -> usize {
        self.count(subscription, Outcome::Acked)
    }

    pub fn nacked(&self, subscription: &str) -> usize {
        self.count(subscription, Outcome::Nacked)
    }

    fn count(&self, subscription: &str, outcome: Outcome) -> usize {
        self.settlements(subscription)
            .iter()
            .filter(|s| s.outcome == outcome)
            .count()
    }

    /// Wait until `subscription` has settled at least `count` deliveries.
    ///
    /// Panics after `timeout`; meant for tests.
    pub async fn wait_for_settled(&self, subscription: &str, count: usize, timeout: Duration) {
        let mut settled = self
            .subscriptions
            .get(subscription)
            .map(|state| state.settled.subscribe())
            .unwrap_or_else(|| panic!("unknown subscription {subscription}"));

        tokio::time::timeout(timeout, settled.wait_for(|n| *n >= count))
            .await
            .unwrap_or_else(|_| panic!("{subscription}: fewer than {count} settlements"))
            .expect("subscription state alive");
    }
}

#[async_trait]
impl Publisher for InMemoryBroker {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.publish_bytes(topic, payload.to_vec());
        Ok(())
    }
}

/// A subscription of an [`InMemoryBroker`].
#[derive(Clone)]
pub struct InMemorySubscription {
    state: Arc<SubscriptionState>,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    type Delivery = InMemoryDelivery;

    fn name(&self) -> &str {
        &self.state.name
    }

    async fn receive(
        &self,
        cancel: CancellationToken,
        sink: DeliverySink<InMemoryDelivery>,
    ) -> Result<(), BrokerError> {
        let mut rx = self
            .state
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| BrokerError::AlreadyReceiving(self.state.name.clone()))?;

        loop {
            let pending = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                pending = rx.recv() => match pending {
                    Some(pending) => pending,
                    None => break,
                },
            };

            let delivery = InMemoryDelivery {
                id: pending.id,
                payload: pending.payload,
                attempt: pending.attempt,
                settled: AtomicBool::new(false),
                state: Arc::clone(&self.state),
            };
            if !sink.deliver(delivery).await && sink.is_closed() {
                break;
            }
        }

        // Hand the queue back so another receiver can pick up where we left off.
        *self.state.rx.lock().unwrap() = Some(rx);
        Ok(())
    }
}

/// A message delivered by an [`InMemorySubscription`].
pub struct InMemoryDelivery {
    id: String,
    payload: Arc<[u8]>,
    attempt: u32,
    settled: AtomicBool,
    state: Arc<SubscriptionState>,
}

impl InMemoryDelivery {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn settle(&self, outcome: Outcome) {
        if !self.settled.swap(true, Ordering::SeqCst) {
            self.state.settle(self, outcome);
        }
    }
}

impl Delivery for InMemoryDelivery {
    fn id(&self) -> &str {
        &self.id
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn ack(&self) {
        self.settle(Outcome::Acked);
    }

    fn nack(&self) {
        self.settle(Outcome::Nacked);
    }
}

/// A subscription whose setup always fails.
pub struct FailingSubscription {
    pub name: String,
    pub reason: String,
}

impl FailingSubscription {
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Subscription for FailingSubscription {
    type Delivery = InMemoryDelivery;

    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(
        &self,
        _cancel: CancellationToken,
        _sink: DeliverySink<InMemoryDelivery>,
    ) -> Result<(), BrokerError> {
        Err(BrokerError::SubscriptionInit {
            subscription: self.name.clone(),
            reason: self.reason.clone(),
        })
    }
}
