//! WebSocket message types.
//!
//! Clients send [`ClientAction`]s tagged by `action`; the server answers with
//! [`ServerMessage`]s tagged by `type`. Stream events arrive as
//! `{"type":"event","conversationId":…,"kind":…}`.

use serde::{Deserialize, Serialize};
use switchboard_core::stream::StartedStream;
use switchboard_core::{ExecutePlanOptions, FullState, StartOptions, StreamMessage, StreamMode};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientAction {
    /// Start a stream and subscribe this connection to it.
    Start {
        conversation_id: String,
        #[serde(flatten)]
        options: StartOptions,
    },
    Subscribe {
        conversation_id: String,
    },
    Unsubscribe {
        conversation_id: String,
    },
    Status,
    Abort {
        conversation_id: String,
    },
    AnswerUserInput {
        conversation_id: String,
        request_id: String,
        answer: String,
        #[serde(default)]
        was_freeform: bool,
    },
    SetMode {
        conversation_id: String,
        mode: StreamMode,
    },
    /// Snapshot of everything running. Also subscribes to every active stream.
    FullState,
    ExecutePlan {
        conversation_id: String,
        #[serde(flatten)]
        options: ExecutePlanOptions,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Started(StartedStream),
    Subscribed {
        conversation_id: String,
    },
    Unsubscribed {
        conversation_id: String,
    },
    Status {
        active_stream_ids: Vec<String>,
    },
    FullState(FullState),
    Event(StreamMessage),
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(conversation_id: Option<&str>, message: impl Into<String>) -> Self {
        Self::Error {
            conversation_id: conversation_id.map(str::to_string),
            message: message.into(),
        }
    }
}
