use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use uuid::Uuid;

use super::{Conversation, MessageStore, NewMessage, StoredMessage};
use crate::error::ChatError;
use crate::util::unix_now_millis;
use crate::wire::Role;

#[derive(Default)]
struct Tables {
    conversations: FxHashMap<Uuid, Conversation>,
    messages: FxHashMap<Uuid, Vec<StoredMessage>>,
}

/// Process-local [`MessageStore`].
///
/// Timestamps are wall-clock milliseconds forced to be strictly increasing,
/// so insertion order and `created_at` order always agree.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    last_tick: AtomicU64,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&self) -> u64 {
        let now = unix_now_millis();
        let mut prev = self.last_tick.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self
                .last_tick
                .compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Number of stored messages across all conversations.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.tables.read().messages.values().map(Vec::len).sum()
    }
}

fn unknown_conversation(id: Uuid) -> ChatError {
    ChatError::NotFound(format!("conversation {id}"))
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn create_conversation(&self, title: &str) -> Result<Conversation, ChatError> {
        let now = self.tick();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        };
        let mut tables = self.tables.write();
        tables
            .conversations
            .insert(conversation.id, conversation.clone());
        tables.messages.insert(conversation.id, Vec::new());
        Ok(conversation)
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, ChatError> {
        Ok(self.tables.read().conversations.get(&id).cloned())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, ChatError> {
        let mut all: Vec<Conversation> =
            self.tables.read().conversations.values().cloned().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(all)
    }

    async fn delete_conversation(&self, id: Uuid) -> Result<(), ChatError> {
        let mut tables = self.tables.write();
        tables.conversations.remove(&id);
        tables.messages.remove(&id);
        Ok(())
    }

    async fn update_title(&self, id: Uuid, title: &str) -> Result<(), ChatError> {
        let now = self.tick();
        let mut tables = self.tables.write();
        let conversation = tables
            .conversations
            .get_mut(&id)
            .ok_or_else(|| unknown_conversation(id))?;
        conversation.title = title.to_string();
        conversation.updated_at = now;
        Ok(())
    }

    async fn insert_message(&self, message: NewMessage) -> Result<StoredMessage, ChatError> {
        let now = self.tick();
        let mut tables = self.tables.write();
        let conversation = tables
            .conversations
            .get_mut(&message.conversation_id)
            .ok_or_else(|| unknown_conversation(message.conversation_id))?;
        conversation.updated_at = now;

        let stored = StoredMessage {
            id: Uuid::new_v4(),
            conversation_id: message.conversation_id,
            role: message.role,
            content: message.content,
            created_at: now,
        };
        tables
            .messages
            .entry(stored.conversation_id)
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<StoredMessage>, ChatError> {
        Ok(self
            .tables
            .read()
            .messages
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn latest_assistant_message(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<StoredMessage>, ChatError> {
        Ok(self
            .tables
            .read()
            .messages
            .get(&conversation_id)
            .and_then(|messages| {
                messages
                    .iter()
                    .rev()
                    .find(|message| message.role == Role::Assistant)
                    .cloned()
            }))
    }

    async fn delete_message(&self, id: Uuid) -> Result<bool, ChatError> {
        let mut tables = self.tables.write();
        for messages in tables.messages.values_mut() {
            if let Some(pos) = messages.iter().position(|message| message.id == id) {
                messages.remove(pos);
                return Ok(true);
            }
        }
        Ok(false)
    }
}
