//! Durable conversation storage.
//!
//! The stream manager only needs three operations from a store: look a
//! conversation up, patch its session/plan pointers, and append a message.
//! [`ConversationStore`] captures that contract; [`MemoryStore`] and
//! [`JsonFileStore`] are the two bundled implementations.
//!
//! # File Structure
//!
//! `JsonFileStore` keeps one document per conversation:
//! ```text
//! {data_dir}/conversations/{conversation_id}.json
//! ```

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stream::accumulation::MessageMetadata;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Conversation not found: {0}")]
    NotFound(String),

    #[error("Invalid conversation id: {0}")]
    InvalidId(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// A message about to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub metadata: Option<MessageMetadata>,
}

impl NewMessage {
    pub fn assistant(content: String, metadata: MessageMetadata) -> Self {
        Self {
            role: MessageRole::Assistant,
            content,
            metadata: if metadata.is_empty() {
                None
            } else {
                Some(metadata)
            },
        }
    }
}

/// A stored message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn from_new(message: NewMessage) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: message.role,
            content: message.content,
            metadata: message.metadata,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    /// Engine session to resume on the next start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Most recent plan artifact written in plan mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_path: Option<PathBuf>,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            session_id: None,
            plan_path: None,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn push(&mut self, message: NewMessage) {
        self.messages.push(Message::from_new(message));
        self.updated_at = Utc::now();
    }
}

/// Partial update of a conversation's pointers.
///
/// The outer `Option` says whether to touch a field; the inner one is the
/// new value, so `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationPatch {
    pub session_id: Option<Option<String>>,
    pub plan_path: Option<Option<PathBuf>>,
}

impl ConversationPatch {
    pub fn session_id(session_id: Option<String>) -> Self {
        Self {
            session_id: Some(session_id),
            ..Self::default()
        }
    }

    pub fn plan_path(plan_path: Option<PathBuf>) -> Self {
        Self {
            plan_path: Some(plan_path),
            ..Self::default()
        }
    }

    pub fn apply(self, conversation: &mut Conversation) {
        if let Some(session_id) = self.session_id {
            conversation.session_id = session_id;
        }
        if let Some(plan_path) = self.plan_path {
            conversation.plan_path = plan_path;
        }
        conversation.updated_at = Utc::now();
    }
}

/// Durable store the stream manager writes turns and session pointers to.
///
/// `update` and `add_message` create the conversation if it does not exist
/// yet, so the event path never has to pre-register conversations.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Result<Option<Conversation>, StoreError>;

    async fn update(&self, id: &str, patch: ConversationPatch) -> Result<(), StoreError>;

    async fn add_message(&self, id: &str, message: NewMessage) -> Result<(), StoreError>;
}
