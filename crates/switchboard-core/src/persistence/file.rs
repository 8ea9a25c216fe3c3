use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Conversation, ConversationPatch, ConversationStore, NewMessage, StoreError};
use crate::paths::is_safe_file_stem;

/// Store that keeps each conversation in its own JSON file.
///
/// # Atomic Write Strategy
///
/// 1. Write to `{id}.json.tmp`
/// 2. Rename to `{id}.json`
///
/// Read-modify-write cycles are serialized by an internal lock so concurrent
/// flushes for the same conversation cannot lose messages.
pub struct JsonFileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        if !is_safe_file_stem(id) {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    fn load(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let path = self.file_path(id)?;
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn save(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let path = self.file_path(&conversation.id)?;
        fs::create_dir_all(&self.dir)?;

        let temp_path = self.dir.join(format!("{}.json.tmp", conversation.id));
        let json = serde_json::to_string_pretty(conversation)?;
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn modify<F>(&self, id: &str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Conversation),
    {
        let _guard = self.write_lock.lock().unwrap();
        let mut conversation = self
            .load(id)?
            .unwrap_or_else(|| Conversation::new(id));
        f(&mut conversation);
        self.save(&conversation)
    }
}

#[async_trait]
impl ConversationStore for JsonFileStore {
    async fn get_by_id(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        self.load(id)
    }

    async fn update(&self, id: &str, patch: ConversationPatch) -> Result<(), StoreError> {
        self.modify(id, |conversation| patch.apply(conversation))
    }

    async fn add_message(&self, id: &str, message: NewMessage) -> Result<(), StoreError> {
        self.modify(id, |conversation| conversation.push(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MessageRole;
    use tempfile::TempDir;

    fn store() -> (TempDir, JsonFileStore) {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("conversations"));
        (dir, store)
    }

    #[tokio::test]
    async fn round_trips_through_disk() {
        let (_dir, store) = store();
        store
            .update("c1", ConversationPatch::session_id(Some("s1".to_string())))
            .await
            .unwrap();
        store
            .add_message(
                "c1",
                NewMessage {
                    role: MessageRole::Assistant,
                    content: "Hello".to_string(),
                    metadata: None,
                },
            )
            .await
            .unwrap();

        let reopened = JsonFileStore::new(store.dir());
        let conv = reopened.get_by_id("c1").await.unwrap().unwrap();
        assert_eq!(conv.session_id.as_deref(), Some("s1"));
        assert_eq!(conv.messages.len(), 1);
        assert_eq!(conv.messages[0].content, "Hello");
    }

    #[tokio::test]
    async fn leaves_no_temp_file() {
        let (_dir, store) = store();
        store
            .update("c1", ConversationPatch::default())
            .await
            .unwrap();

        assert!(store.dir().join("c1.json").exists());
        assert!(!store.dir().join("c1.json.tmp").exists());
    }

    #[tokio::test]
    async fn missing_conversation_is_none() {
        let (_dir, store) = store();
        assert!(store.get_by_id("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_path_traversal_ids() {
        let (_dir, store) = store();
        let result = store.update("../evil", ConversationPatch::default()).await;
        assert!(matches!(result, Err(StoreError::InvalidId(_))));
    }
}
