use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Conversation, ConversationPatch, ConversationStore, Message, NewMessage, StoreError};

/// In-process store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    conversations: Mutex<HashMap<String, Conversation>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or replace a conversation.
    pub fn insert(&self, conversation: Conversation) {
        self.conversations
            .lock()
            .unwrap()
            .insert(conversation.id.clone(), conversation);
    }

    /// Messages stored for a conversation, oldest first.
    pub fn messages(&self, id: &str) -> Vec<Message> {
        self.conversations
            .lock()
            .unwrap()
            .get(id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, id: &str) -> Option<Conversation> {
        self.conversations.lock().unwrap().get(id).cloned()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn get_by_id(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        Ok(self.get(id))
    }

    async fn update(&self, id: &str, patch: ConversationPatch) -> Result<(), StoreError> {
        let mut conversations = self.conversations.lock().unwrap();
        let conversation = conversations
            .entry(id.to_string())
            .or_insert_with(|| Conversation::new(id));
        patch.apply(conversation);
        Ok(())
    }

    async fn add_message(&self, id: &str, message: NewMessage) -> Result<(), StoreError> {
        let mut conversations = self.conversations.lock().unwrap();
        conversations
            .entry(id.to_string())
            .or_insert_with(|| Conversation::new(id))
            .push(message);
        Ok(())
    }
}
