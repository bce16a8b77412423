use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use batchwire::{
    CancellationToken, Cancelled, EventEnvelope, GenerateBoardSummary, GenerateChatSummary,
    GenerateConversationTitle,
};
use tokio::sync::watch;
use uuid::Uuid;

/// One recorded use case invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub use_case: &'static str,
    pub event: Option<EventEnvelope>,
}

/// Use case double for every worker kind.
///
/// Besides recording calls it applies an idempotent effect: the latest
/// message id per conversation and a board summary "generated" flag, so
/// tests can compare the effect of N deliveries with that of one.
pub struct Recorder {
    calls: Mutex<Vec<Call>>,
    count: watch::Sender<usize>,
    failing_conversations: Mutex<HashSet<String>>,
    failures_left: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    effects: Mutex<BTreeMap<String, Option<Uuid>>>,
}

impl Default for Recorder {
    fn default() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            calls: Mutex::new(Vec::new()),
            count,
            failing_conversations: Mutex::new(HashSet::new()),
            failures_left: AtomicUsize::new(0),
            delay: Mutex::new(None),
            effects: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls, whatever the event.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Fail every call for this conversation.
    pub fn fail_conversation(&self, conversation_id: impl Into<String>) {
        self.failing_conversations
            .lock()
            .unwrap()
            .insert(conversation_id.into());
    }

    /// Make every call take `delay`, aborting with [`Cancelled`] if the run
    /// context is cancelled meanwhile.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Calls whose event belongs to `conversation_id`.
    pub fn calls_for(&self, conversation_id: &str) -> Vec<EventEnvelope> {
        self.calls()
            .into_iter()
            .filter_map(|call| call.event)
            .filter(|event| event.conversation() == Some(conversation_id))
            .collect()
    }

    /// The effect store: conversation (or `"board"`) → last message id.
    pub fn effects(&self) -> BTreeMap<String, Option<Uuid>> {
        self.effects.lock().unwrap().clone()
    }

    /// Wait until at least `n` calls were recorded. Panics after `timeout`.
    pub async fn wait_for_calls(&self, n: usize, timeout: Duration) {
        let mut count = self.count.subscribe();
        tokio::time::timeout(timeout, count.wait_for(|c| *c >= n))
            .await
            .unwrap_or_else(|_| panic!("fewer than {n} use case calls"))
            .expect("recorder alive");
    }

    async fn record(
        &self,
        use_case: &'static str,
        cancel: &CancellationToken,
        event: Option<&EventEnvelope>,
    ) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(Call {
            use_case,
            event: event.cloned(),
        });
        self.count.send_modify(|c| *c += 1);
        tracing::debug!(use_case, ?event, "use case called");

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(Cancelled.into()),
            }
        }

        let fail_once = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail_once {
            anyhow::bail!("{use_case} failed on purpose");
        }

        let key = match event.and_then(EventEnvelope::conversation) {
            Some(conversation) => {
                if self.failing_conversations.lock().unwrap().contains(conversation) {
                    anyhow::bail!("{use_case} failed for conversation {conversation}");
                }
                conversation.to_string()
            }
            None => "board".to_string(),
        };

        self.effects
            .lock()
            .unwrap()
            .insert(key, event.and_then(|e| e.chat_message_id));
        Ok(())
    }
}

#[async_trait]
impl GenerateBoardSummary for Recorder {
    async fn generate_board_summary(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        self.record("board_summary", cancel, None).await
    }
}

#[async_trait]
impl GenerateChatSummary for Recorder {
    async fn generate_chat_summary(
        &self,
        cancel: &CancellationToken,
        event: &EventEnvelope,
    ) -> anyhow::Result<()> {
        self.record("chat_summary", cancel, Some(event)).await
    }
}

#[async_trait]
impl GenerateConversationTitle for Recorder {
    async fn generate_conversation_title(
        &self,
        cancel: &CancellationToken,
        event: &EventEnvelope,
    ) -> anyhow::Result<()> {
        self.record("conversation_title", cancel, Some(event)).await
    }
}
