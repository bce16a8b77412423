//! # Todo Pipeline Demo
//!
//! A todo app's write path and its background consumers, wired end to end
//! on the in-memory broker:
//!
//! - Mutations write outbox rows
//! - The relay publishes them every 500 ms
//! - Three batch workers coalesce bursts into one call per key
//!
//! Run with `RUST_LOG=debug` to watch the flushes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use batchwire::{
    board_summary_worker, chat_summary_worker, conversation_title_worker, BatchWorkerConfig,
    CancellationToken, ChatRole, EventEnvelope, EventType, GenerateBoardSummary,
    GenerateChatSummary, GenerateConversationTitle, OutboxRelay, RelayConfig,
};
use batchwire_outbox::{InMemoryOutboxStore, OutboxDispatcher, OutboxEvent, OutboxStore};
use batchwire_testing::InMemoryBroker;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const TODO_TOPIC: &str = "todo-events";
const CHAT_TOPIC: &str = "chat-events";

// ============================================================================
// Use cases (stand-ins for the LLM calls)
// ============================================================================

#[derive(Default)]
struct LoggingUseCases {
    calls: AtomicUsize,
}

impl LoggingUseCases {
    async fn pretend_work(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
}

#[async_trait]
impl GenerateBoardSummary for LoggingUseCases {
    async fn generate_board_summary(&self, _cancel: &CancellationToken) -> Result<()> {
        self.pretend_work().await;
        info!("regenerated board summary");
        Ok(())
    }
}

#[async_trait]
impl GenerateChatSummary for LoggingUseCases {
    async fn generate_chat_summary(
        &self,
        _cancel: &CancellationToken,
        event: &EventEnvelope,
    ) -> Result<()> {
        self.pretend_work().await;
        info!(conversation = ?event.conversation(), message = ?event.chat_message_id, "summarized chat");
        Ok(())
    }
}

#[async_trait]
impl GenerateConversationTitle for LoggingUseCases {
    async fn generate_conversation_title(
        &self,
        _cancel: &CancellationToken,
        event: &EventEnvelope,
    ) -> Result<()> {
        self.pretend_work().await;
        info!(conversation = ?event.conversation(), "titled conversation");
        Ok(())
    }
}

// ============================================================================
// Write path
// ============================================================================

async fn seed(store: &InMemoryOutboxStore) -> Result<usize> {
    let mut rows = Vec::new();

    // A user editing their board: five mutations, one board summary.
    for (i, event_type) in [
        EventType::TodoCreated,
        EventType::TodoCreated,
        EventType::TodoUpdated,
        EventType::TodoUpdated,
        EventType::TodoDeleted,
    ]
    .into_iter()
    .enumerate()
    {
        rows.push(OutboxEvent::from_envelope(
            "todo",
            format!("todo-{i}"),
            TODO_TOPIC,
            &EventEnvelope::todo(event_type),
        )?);
    }

    // Two conversations, each a few turns long.
    for conversation in ["conv-a", "conv-b"] {
        for turn in 0..3 {
            let role = if turn % 2 == 0 {
                ChatRole::User
            } else {
                ChatRole::Assistant
            };
            let envelope = EventEnvelope::chat_message(conversation, Uuid::new_v4(), role);
            rows.push(OutboxEvent::from_envelope(
                "chat_message",
                conversation,
                CHAT_TOPIC,
                &envelope,
            )?);
        }
    }

    let count = rows.len();
    for row in rows {
        store.insert(row).await?;
    }
    Ok(count)
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let broker = InMemoryBroker::new();
    let store = InMemoryOutboxStore::new();
    let use_cases = Arc::new(LoggingUseCases::default());

    let board = board_summary_worker(
        broker.subscribe(TODO_TOPIC, "todo-summary"),
        Arc::clone(&use_cases),
        BatchWorkerConfig::default(),
    )?;
    let chat = chat_summary_worker(
        broker.subscribe(CHAT_TOPIC, "chat-summary"),
        Arc::clone(&use_cases),
        BatchWorkerConfig::default(),
    )?;
    let titles = conversation_title_worker(
        broker.subscribe(CHAT_TOPIC, "conversation-title"),
        Arc::clone(&use_cases),
        BatchWorkerConfig::default(),
    )?;
    let relay = OutboxRelay::new(
        OutboxDispatcher::new(store.clone(), broker.clone()),
        RelayConfig::default(),
    );

    let seeded = seed(&store).await?;
    info!(seeded, "outbox seeded");

    let cancel = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();
    {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            relay.run(cancel).await;
            Ok(())
        });
    }
    {
        let cancel = cancel.clone();
        tasks.spawn(async move { board.run(cancel).await });
    }
    {
        let cancel = cancel.clone();
        tasks.spawn(async move { chat.run(cancel).await });
    }
    {
        let cancel = cancel.clone();
        tasks.spawn(async move { titles.run(cancel).await });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
    }
    cancel.cancel();

    while let Some(joined) = tasks.join_next().await {
        joined??;
    }

    info!(
        events = seeded,
        use_case_calls = use_cases.calls.load(Ordering::Relaxed),
        outbox_left = store.len(),
        "demo finished"
    );
    Ok(())
}
