//! Typed view of an event payload as it travels through the broker.
//!
//! Payloads are JSON objects of the form
//!
//! ```json
//! { "type": "chat_message_sent", "chat_role": "user",
//!   "chat_message_id": "…", "conversation_id": "…" }
//! ```
//!
//! Extra fields are ignored. An unknown `type` still decodes (as
//! [`EventType::Unknown`]) so that newer producers don't turn into poison
//! messages for older consumers; invalid JSON, a missing `type` or a
//! mistyped field is a decode error.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Discriminant of a domain event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TodoCreated,
    TodoUpdated,
    TodoDeleted,
    ChatMessageSent,
    /// A type this build does not know about.
    #[serde(other)]
    Unknown,
}

impl EventType {
    /// Whether this event changes the todo board.
    pub fn is_todo_event(self) -> bool {
        matches!(
            self,
            EventType::TodoCreated | EventType::TodoUpdated | EventType::TodoDeleted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::TodoCreated => "todo_created",
            EventType::TodoUpdated => "todo_updated",
            EventType::TodoDeleted => "todo_deleted",
            EventType::ChatMessageSent => "chat_message_sent",
            EventType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    System,
    Tool,
    #[serde(other)]
    Other,
}

/// Decoded event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: EventType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_role: Option<ChatRole>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_message_id: Option<Uuid>,

    /// Conversation the event belongs to. Usually a UUID, but any string is
    /// accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl EventEnvelope {
    /// Decode a raw broker payload.
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Encode for publishing.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Envelope for a board-level todo event.
    pub fn todo(event_type: EventType) -> Self {
        Self {
            event_type,
            chat_role: None,
            chat_message_id: None,
            conversation_id: None,
        }
    }

    /// Envelope for a chat message that was just stored.
    pub fn chat_message(
        conversation_id: impl Into<String>,
        chat_message_id: Uuid,
        role: ChatRole,
    ) -> Self {
        Self {
            event_type: EventType::ChatMessageSent,
            chat_role: Some(role),
            chat_message_id: Some(chat_message_id),
            conversation_id: Some(conversation_id.into()),
        }
    }

    /// Non-empty conversation id, if any.
    pub fn conversation(&self) -> Option<&str> {
        self.conversation_id.as_deref().filter(|id| !id.is_empty())
    }
}
