//! Raw event type delivered by execution engine sessions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Quota snapshot key that tracks premium request consumption.
pub const PREMIUM_REQUESTS: &str = "premium_requests";

/// One named quota bucket as reported by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSnapshot {
    pub used_requests: u64,
    /// Request allowance for the period. Zero means unlimited.
    pub entitlement_requests: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_date: Option<String>,
}

/// Event emitted by an engine session.
///
/// Message, tool-call and reasoning ids are stable across redelivery, so the
/// accumulator uses them to drop duplicates. Text deltas carry no stable id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EngineEvent {
    /// Streaming text fragment.
    TextDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        delta: String,
    },

    /// A complete assistant text message.
    TextMessage { message_id: String, content: String },

    /// A tool invocation began.
    ToolStart {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        arguments: serde_json::Value,
    },

    /// A tool invocation finished.
    ToolEnd {
        tool_call_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        /// Engine-specific error value: a string, an object with `message`, or anything else.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<serde_json::Value>,
    },

    /// Streaming reasoning fragment. `delta_id`, when present, identifies this
    /// fragment (not the reasoning block) and is used for dedup.
    ReasoningDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delta_id: Option<String>,
        delta: String,
    },

    /// The final text of a reasoning block.
    ReasoningComplete { reasoning_id: String, content: String },

    /// Token usage for one model call.
    Usage {
        #[serde(default)]
        input_tokens: u64,
        #[serde(default)]
        output_tokens: u64,
        #[serde(default)]
        cache_read_tokens: u64,
        #[serde(default)]
        cache_write_tokens: u64,
    },

    /// Account quota snapshots keyed by bucket name.
    Quota {
        snapshots: HashMap<String, QuotaSnapshot>,
    },

    /// The session finished its turn.
    Idle,

    /// The session reported a failure.
    Error { message: String },
}
