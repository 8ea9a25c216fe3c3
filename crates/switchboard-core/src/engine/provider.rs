//! Contract between the stream manager and an execution engine.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use super::event::EngineEvent;
use crate::stream::bridge::{PermissionHandler, UserInputBridge};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Failed to create session: {0}")]
    Create(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Failed to send message: {0}")]
    Send(String),

    #[error("Failed to abort session: {0}")]
    Abort(String),
}

/// A tool the engine is allowed to expose to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "camelCase")]
pub enum ToolCapability {
    /// A tool that ships with the engine, by name.
    BuiltIn { name: String },
    /// Sub-agent delegation.
    Task,
    Memory,
    WebSearch,
    /// A tool served by an MCP server.
    Mcp { server: String, tool: String },
}

impl ToolCapability {
    pub fn built_in(name: impl Into<String>) -> Self {
        ToolCapability::BuiltIn { name: name.into() }
    }
}

/// A file handed to the engine alongside a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Everything a provider needs to create or resume a session.
#[derive(Clone)]
pub struct SessionOptions {
    pub resume_session_id: Option<String>,
    pub model: Option<String>,
    pub working_dir: PathBuf,
    pub permission: PermissionHandler,
    pub user_input: UserInputBridge,
    pub system_message: Option<String>,
    pub skill_dirs: Vec<PathBuf>,
    pub disabled_skills: Vec<String>,
    pub tools: Vec<ToolCapability>,
}

/// A live session. `events` is the subscription point: the manager drains it
/// until the session goes idle, and dropping it detaches.
#[derive(Debug)]
pub struct ProviderSession {
    pub session_id: String,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
}

#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Resume `options.resume_session_id` if set and known, otherwise create a
    /// new session.
    async fn get_or_create_session(
        &self,
        options: SessionOptions,
    ) -> Result<ProviderSession, ProviderError>;

    async fn send_message(
        &self,
        session_id: &str,
        prompt: &str,
        attachments: &[Attachment],
    ) -> Result<(), ProviderError>;

    async fn abort_message(&self, session_id: &str) -> Result<(), ProviderError>;

    /// Release every session. Called once during graceful shutdown.
    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_capability_tagged_by_source() {
        let tools = vec![
            ToolCapability::built_in("view"),
            ToolCapability::Task,
            ToolCapability::Mcp {
                server: "github".to_string(),
                tool: "search_issues".to_string(),
            },
        ];

        assert_eq!(
            serde_json::to_value(&tools).unwrap(),
            json!([
                {"source": "builtIn", "name": "view"},
                {"source": "task"},
                {"source": "mcp", "server": "github", "tool": "search_issues"}
            ])
        );
    }

    #[test]
    fn web_search_parses() {
        let tool: ToolCapability = serde_json::from_value(json!({"source": "webSearch"})).unwrap();
        assert_eq!(tool, ToolCapability::WebSearch);
    }

    #[test]
    fn attachment_display_name_is_optional() {
        let attachment: Attachment =
            serde_json::from_value(json!({"path": "/tmp/a.png"})).unwrap();
        assert_eq!(attachment.path, PathBuf::from("/tmp/a.png"));
        assert!(attachment.display_name.is_none());
    }
}
