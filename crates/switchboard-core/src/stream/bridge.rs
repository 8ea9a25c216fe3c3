//! Callbacks handed to the session provider when a stream starts.
//!
//! Both are bound to their stream: the permission handler reads the stream's
//! live mode on every decision, and the user-input bridge routes questions
//! into the stream's pending-input registry.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};

use super::event::StreamMode;
use super::manager::ManagerInner;
use super::pending_input::{UserInputError, UserInputPrompt, UserInputResponse};

/// Shared, mutable mode of one stream.
#[derive(Debug, Clone, Default)]
pub struct ModeCell(Arc<Mutex<StreamMode>>);

impl ModeCell {
    pub fn new(mode: StreamMode) -> Self {
        Self(Arc::new(Mutex::new(mode)))
    }

    pub fn get(&self) -> StreamMode {
        *self.0.lock().unwrap()
    }

    pub fn set(&self, mode: StreamMode) {
        *self.0.lock().unwrap() = mode;
    }
}

/// A tool permission request raised by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionDecision {
    Approved,
    DeniedByRules,
}

/// Approves everything in act mode and denies everything in plan mode.
#[derive(Debug, Clone)]
pub struct PermissionHandler {
    mode: ModeCell,
}

impl PermissionHandler {
    pub fn new(mode: ModeCell) -> Self {
        Self { mode }
    }

    pub fn decide(&self, request: &PermissionRequest) -> PermissionDecision {
        let decision = match self.mode.get() {
            StreamMode::Act => PermissionDecision::Approved,
            StreamMode::Plan => PermissionDecision::DeniedByRules,
        };
        log::debug!(
            "Permission {} ({}): {:?}",
            request.kind,
            request.tool_name.as_deref().unwrap_or("-"),
            decision
        );
        decision
    }
}

/// Lets an engine ask the human a question through the owning stream.
#[derive(Clone)]
pub struct UserInputBridge {
    manager: Weak<ManagerInner>,
    conversation_id: String,
}

impl fmt::Debug for UserInputBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserInputBridge")
            .field("conversation_id", &self.conversation_id)
            .finish()
    }
}

impl UserInputBridge {
    pub(crate) fn new(manager: Weak<ManagerInner>, conversation_id: impl Into<String>) -> Self {
        Self {
            manager,
            conversation_id: conversation_id.into(),
        }
    }

    /// A bridge with no stream behind it. Every question is aborted.
    pub fn detached(conversation_id: impl Into<String>) -> Self {
        Self::new(Weak::new(), conversation_id)
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Ask a question and wait for the answer.
    ///
    /// Resolves when a client answers, the request times out, or the stream
    /// is torn down (aborted).
    pub async fn ask(&self, prompt: UserInputPrompt) -> Result<UserInputResponse, UserInputError> {
        let receiver = {
            let inner = self.manager.upgrade().ok_or(UserInputError::Aborted)?;
            inner
                .register_user_input(&self.conversation_id, prompt)
                .ok_or(UserInputError::Aborted)?
        };
        receiver.await.unwrap_or(Err(UserInputError::Aborted))
    }
}
