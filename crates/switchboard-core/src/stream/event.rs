//! Normalized events delivered to stream subscribers.

use serde::{Deserialize, Serialize};

use super::accumulation::ToolStatus;
use super::pending_input::UserInputRequestInfo;
use crate::quota::QuotaInfo;

/// Gates tool permissions for a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Read-only: every permission request is denied.
    Plan,
    #[default]
    Act,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Running,
    Idle,
    Error,
}

/// Event forwarded to subscribers and kept in the replay buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum StreamEvent {
    Error {
        message: String,
    },

    /// The turn finished and was flushed.
    Idle {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        plan_path: Option<String>,
    },

    ModeChanged {
        mode: StreamMode,
    },

    TextDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        delta: String,
    },

    TextMessage {
        message_id: String,
        content: String,
    },

    ToolStart {
        tool_call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    ToolEnd {
        tool_call_id: String,
        tool_name: String,
        status: ToolStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    ReasoningDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delta_id: Option<String>,
        delta: String,
    },

    ReasoningComplete {
        reasoning_id: String,
        content: String,
    },

    Usage {
        input_tokens: u64,
        output_tokens: u64,
        cache_read_tokens: u64,
        cache_write_tokens: u64,
    },

    Quota(QuotaInfo),

    UserInputRequest(UserInputRequestInfo),

    UserInputTimeout {
        request_id: String,
        question: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        choices: Option<Vec<String>>,
    },
}

/// A [`StreamEvent`] enriched with the conversation it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessage {
    pub conversation_id: String,
    #[serde(flatten)]
    pub event: StreamEvent,
}

impl StreamMessage {
    pub fn new(conversation_id: impl Into<String>, event: StreamEvent) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            event,
        }
    }
}
