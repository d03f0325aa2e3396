use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::StoredMessage;
use crate::stream::{Increment, IncrementKind};
use crate::wire::Role;

/// A message as the session renders it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub role: Role,
    pub content: String,
    /// Reasoning text shown above the answer. Never persisted.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thinking: String,
}

impl ChatMessage {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::User,
            content: content.into(),
            thinking: String::new(),
        }
    }

    #[must_use]
    pub fn assistant() -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::Assistant,
            content: String::new(),
            thinking: String::new(),
        }
    }

    pub(crate) fn apply(&mut self, increment: &Increment) {
        match increment.kind {
            IncrementKind::Reasoning => self.thinking.push_str(&increment.text),
            IncrementKind::Content => self.content.push_str(&increment.text),
        }
    }
}

impl From<StoredMessage> for ChatMessage {
    fn from(stored: StoredMessage) -> Self {
        Self {
            id: stored.id,
            role: stored.role,
            content: stored.content,
            thinking: String::new(),
        }
    }
}

/// Per-turn toggles sent with the chat request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOptions {
    pub search: bool,
    pub think: bool,
}

impl SendOptions {
    #[must_use]
    pub fn search() -> Self {
        Self {
            search: true,
            think: false,
        }
    }

    #[must_use]
    pub fn think() -> Self {
        Self {
            search: false,
            think: true,
        }
    }
}

/// Broadcast to [`super::ChatSession::subscribe`] receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    MessageAdded(ChatMessage),
    Increment { message_id: Uuid, increment: Increment },
    MessageRemoved { message_id: Uuid },
    TitleChanged(String),
    TurnFinished { message_id: Uuid },
    TurnFailed { message: String },
}

/// What a completed turn produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnSummary {
    pub message_id: Uuid,
    pub content: String,
    pub thinking: String,
    pub increments: usize,
    pub persisted: bool,
    pub elapsed: Duration,
}
