//! Conversation and message persistence.
//!
//! [`MessageStore`] is the seam a database adapter plugs into;
//! [`InMemoryStore`] backs tests and single-process use.

mod memory;

pub use memory::InMemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ChatError;
use crate::wire::Role;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub title: String,
    /// Unix epoch milliseconds.
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: Role,
    pub content: String,
    pub created_at: u64,
}

/// A message about to be inserted; the store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub role: Role,
    pub content: String,
}

impl NewMessage {
    #[must_use]
    pub fn new(conversation_id: Uuid, role: Role, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            role,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_conversation(&self, title: &str) -> Result<Conversation, ChatError>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, ChatError>;

    /// All conversations, most recently updated first.
    async fn list_conversations(&self) -> Result<Vec<Conversation>, ChatError>;

    /// Delete a conversation and all of its messages. Unknown ids are a no-op.
    async fn delete_conversation(&self, id: Uuid) -> Result<(), ChatError>;

    async fn update_title(&self, id: Uuid, title: &str) -> Result<(), ChatError>;

    async fn insert_message(&self, message: NewMessage) -> Result<StoredMessage, ChatError>;

    /// Messages of one conversation in insertion order.
    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<StoredMessage>, ChatError>;

    async fn latest_assistant_message(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<StoredMessage>, ChatError>;

    /// Returns whether a message was removed.
    async fn delete_message(&self, id: Uuid) -> Result<bool, ChatError>;
}
