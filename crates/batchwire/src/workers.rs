//! The three consumers of the todo application and the use cases they
//! drive.
//!
//! | worker | reacts to | coalesced by | default batch | usual subscription |
//! |---|---|---|---|---|
//! | board summary | todo created/updated/deleted | whole batch | 50 | `todo-summary` |
//! | chat summary | assistant chat messages | conversation | 20 | `chat-summary` |
//! | conversation title | user chat messages | conversation | 20 | `conversation-title` |
//!
//! The subscription itself is whatever the caller passes in; the config's
//! `subscription` field is filled from it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::broker::Subscription;
use crate::config::BatchWorkerConfig;
use crate::error::WorkerError;
use crate::envelope::{ChatRole, EventEnvelope, EventType};
use crate::handler::{EventHandler, Routing};
use crate::worker::BatchWorker;

/// Regenerates the AI summary of the todo board.
#[async_trait]
pub trait GenerateBoardSummary: Send + Sync + 'static {
    async fn generate_board_summary(&self, cancel: &CancellationToken) -> anyhow::Result<()>;
}

/// Regenerates the running summary of one conversation.
#[async_trait]
pub trait GenerateChatSummary: Send + Sync + 'static {
    async fn generate_chat_summary(
        &self,
        cancel: &CancellationToken,
        event: &EventEnvelope,
    ) -> anyhow::Result<()>;
}

/// Generates (or refreshes) the title of one conversation.
#[async_trait]
pub trait GenerateConversationTitle: Send + Sync + 'static {
    async fn generate_conversation_title(
        &self,
        cancel: &CancellationToken,
        event: &EventEnvelope,
    ) -> anyhow::Result<()>;
}

#[async_trait]
impl<T: GenerateBoardSummary + ?Sized> GenerateBoardSummary for Arc<T> {
    async fn generate_board_summary(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        (**self).generate_board_summary(cancel).await
    }
}

#[async_trait]
impl<T: GenerateChatSummary + ?Sized> GenerateChatSummary for Arc<T> {
    async fn generate_chat_summary(
        &self,
        cancel: &CancellationToken,
        event: &EventEnvelope,
    ) -> anyhow::Result<()> {
        (**self).generate_chat_summary(cancel, event).await
    }
}

#[async_trait]
impl<T: GenerateConversationTitle + ?Sized> GenerateConversationTitle for Arc<T> {
    async fn generate_conversation_title(
        &self,
        cancel: &CancellationToken,
        event: &EventEnvelope,
    ) -> anyhow::Result<()> {
        (**self).generate_conversation_title(cancel, event).await
    }
}

fn conversation_key(event: &EventEnvelope, role: ChatRole) -> Routing {
    if event.event_type != EventType::ChatMessageSent || event.chat_role != Some(role) {
        return Routing::Ignore;
    }
    match event.conversation() {
        Some(id) => Routing::Key(id.to_string()),
        None => Routing::Unroutable,
    }
}

// ============================================================================
// Board summary
// ============================================================================

pub struct BoardSummaryHandler<U> {
    use_case: U,
}

impl<U> BoardSummaryHandler<U> {
    pub fn new(use_case: U) -> Self {
        Self { use_case }
    }

    /// Batch size and interval used when the caller leaves them unset.
    pub fn default_config() -> BatchWorkerConfig {
        BatchWorkerConfig::default()
            .with_batch_size(50)
            .with_flush_interval(Duration::from_secs(3))
    }
}

#[async_trait]
impl<U: GenerateBoardSummary> EventHandler for BoardSummaryHandler<U> {
    fn name(&self) -> &'static str {
        "board_summary"
    }

    fn route(&self, event: &EventEnvelope) -> Routing {
        if event.event_type.is_todo_event() {
            Routing::Batch
        } else {
            Routing::Ignore
        }
    }

    async fn handle(
        &self,
        cancel: &CancellationToken,
        _event: &EventEnvelope,
    ) -> anyhow::Result<()> {
        self.use_case.generate_board_summary(cancel).await
    }
}

/// Board summary worker with its defaults applied to `config`.
///
/// Fails if `config.subscription` names a different subscription.
pub fn board_summary_worker<S, U>(
    subscription: S,
    use_case: U,
    config: BatchWorkerConfig,
) -> Result<BatchWorker<S, BoardSummaryHandler<U>>, WorkerError>
where
    S: Subscription,
    U: GenerateBoardSummary,
{
    let config = config.normalized(&BoardSummaryHandler::<U>::default_config());
    BatchWorker::new(subscription, BoardSummaryHandler::new(use_case), config)
}

// ============================================================================
// Chat summary
// ============================================================================

pub struct ChatSummaryHandler<U> {
    use_case: U,
}

impl<U> ChatSummaryHandler<U> {
    pub fn new(use_case: U) -> Self {
        Self { use_case }
    }

    /// Batch size and interval used when the caller leaves them unset.
    pub fn default_config() -> BatchWorkerConfig {
        BatchWorkerConfig::default()
            .with_batch_size(20)
            .with_flush_interval(Duration::from_secs(3))
    }
}

#[async_trait]
impl<U: GenerateChatSummary> EventHandler for ChatSummaryHandler<U> {
    fn name(&self) -> &'static str {
        "chat_summary"
    }

    fn route(&self, event: &EventEnvelope) -> Routing {
        conversation_key(event, ChatRole::Assistant)
    }

    async fn handle(
        &self,
        cancel: &CancellationToken,
        event: &EventEnvelope,
    ) -> anyhow::Result<()> {
        self.use_case.generate_chat_summary(cancel, event).await
    }
}

pub fn chat_summary_worker<S, U>(
    subscription: S,
    use_case: U,
    config: BatchWorkerConfig,
) -> Result<BatchWorker<S, ChatSummaryHandler<U>>, WorkerError>
where
    S: Subscription,
    U: GenerateChatSummary,
{
    let config = config.normalized(&ChatSummaryHandler::<U>::default_config());
    BatchWorker::new(subscription, ChatSummaryHandler::new(use_case), config)
}

// ============================================================================
// Conversation title
// ============================================================================

pub struct ConversationTitleHandler<U> {
    use_case: U,
}

impl<U> ConversationTitleHandler<U> {
    pub fn new(use_case: U) -> Self {
        Self { use_case }
    }

    /// Batch size and interval used when the caller leaves them unset.
    pub fn default_config() -> BatchWorkerConfig {
        BatchWorkerConfig::default()
            .with_batch_size(20)
            .with_flush_interval(Duration::from_secs(3))
    }
}

#[async_trait]
impl<U: GenerateConversationTitle> EventHandler for ConversationTitleHandler<U> {
    fn name(&self) -> &'static str {
        "conversation_title"
    }

    fn route(&self, event: &EventEnvelope) -> Routing {
        conversation_key(event, ChatRole::User)
    }

    async fn handle(
        &self,
        cancel: &CancellationToken,
        event: &EventEnvelope,
    ) -> anyhow::Result<()> {
        self.use_case.generate_conversation_title(cancel, event).await
    }
}

pub fn conversation_title_worker<S, U>(
    subscription: S,
    use_case: U,
    config: BatchWorkerConfig,
) -> Result<BatchWorker<S, ConversationTitleHandler<U>>, WorkerError>
where
    S: Subscription,
    U: GenerateConversationTitle,
{
    let config = config.normalized(&ConversationTitleHandler::<U>::default_config());
    BatchWorker::new(subscription, ConversationTitleHandler::new(use_case), config)
}
