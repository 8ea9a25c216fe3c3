//! The in-flight turn: everything an assistant response has produced so far.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Running,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRecord {
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One piece of a turn in the order the engine produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TurnSegment {
    Text { content: String },
    Tool(ToolRecord),
    Reasoning { content: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(other.cache_read_tokens);
        self.cache_write_tokens = self
            .cache_write_tokens
            .saturating_add(other.cache_write_tokens);
    }

    pub fn is_zero(&self) -> bool {
        *self == TokenUsage::default()
    }
}

/// Usage as stored in message metadata. Cache counters are omitted when zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<u64>,
}

impl From<TokenUsage> for PersistedUsage {
    fn from(usage: TokenUsage) -> Self {
        let non_zero = |n: u64| (n > 0).then_some(n);
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_tokens: non_zero(usage.cache_read_tokens),
            cache_write_tokens: non_zero(usage.cache_write_tokens),
        }
    }
}

/// Metadata attached to a flushed assistant message. Keys are present only
/// when they carry something.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_segments: Option<Vec<TurnSegment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_records: Option<Vec<ToolRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<PersistedUsage>,
}

impl MessageMetadata {
    pub fn is_empty(&self) -> bool {
        self.turn_segments.is_none() && self.tool_records.is_none() && self.usage.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Accumulation {
    pub text_segments: Vec<String>,
    pub tool_records: Vec<ToolRecord>,
    pub reasoning: String,
    pub turn_segments: Vec<TurnSegment>,
    pub usage: TokenUsage,
    /// Live view of text deltas. Superseded by the complete message and never persisted.
    pub streaming_text: String,
}

impl Accumulation {
    pub fn append_delta(&mut self, delta: &str) {
        self.streaming_text.push_str(delta);
    }

    pub fn push_text(&mut self, content: String) {
        self.streaming_text.clear();
        self.turn_segments.push(TurnSegment::Text {
            content: content.clone(),
        });
        self.text_segments.push(content);
    }

    pub fn start_tool(&mut self, tool_call_id: String, tool_name: String, arguments: serde_json::Value) {
        let record = ToolRecord {
            tool_call_id,
            tool_name,
            arguments,
            status: ToolStatus::Running,
            result: None,
            error: None,
        };
        self.turn_segments.push(TurnSegment::Tool(record.clone()));
        self.tool_records.push(record);
    }

    /// Complete the first record with this tool-call id and mirror it into
    /// its turn segment. Returns the updated record, or `None` when no
    /// matching start was seen.
    pub fn finish_tool(
        &mut self,
        tool_call_id: &str,
        success: bool,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Option<ToolRecord> {
        let record = self
            .tool_records
            .iter_mut()
            .find(|r| r.tool_call_id == tool_call_id)?;
        record.status = if success {
            ToolStatus::Success
        } else {
            ToolStatus::Error
        };
        record.result = result;
        record.error = error;
        let updated = record.clone();

        if let Some(segment) = self.turn_segments.iter_mut().find(
            |s| matches!(s, TurnSegment::Tool(r) if r.tool_call_id == tool_call_id),
        ) {
            *segment = TurnSegment::Tool(updated.clone());
        }
        Some(updated)
    }

    pub fn append_reasoning(&mut self, delta: &str) {
        self.reasoning.push_str(delta);
    }

    /// Record the final reasoning text for the turn.
    ///
    /// A turn keeps at most one reasoning segment. An existing one is
    /// overwritten in place; otherwise it goes right before the first text
    /// segment, or at the end when there is no text yet.
    pub fn complete_reasoning(&mut self, content: &str) {
        if self.reasoning.is_empty() {
            self.reasoning.push_str(content);
        }
        let segment = TurnSegment::Reasoning {
            content: self.reasoning.clone(),
        };

        if let Some(existing) = self
            .turn_segments
            .iter_mut()
            .find(|s| matches!(s, TurnSegment::Reasoning { .. }))
        {
            *existing = segment;
            return;
        }

        match self
            .turn_segments
            .iter()
            .position(|s| matches!(s, TurnSegment::Text { .. }))
        {
            Some(index) => self.turn_segments.insert(index, segment),
            None => self.turn_segments.push(segment),
        }
    }

    pub fn add_usage(&mut self, usage: TokenUsage) {
        self.usage.add(usage);
    }

    /// Message body: text segments separated by blank lines.
    pub fn content(&self) -> String {
        self.text_segments.join("\n\n")
    }

    pub fn has_content(&self) -> bool {
        !self.text_segments.is_empty() || !self.turn_segments.is_empty()
    }

    pub fn metadata(&self) -> MessageMetadata {
        MessageMetadata {
            turn_segments: (!self.turn_segments.is_empty()).then(|| self.turn_segments.clone()),
            tool_records: (!self.tool_records.is_empty()).then(|| self.tool_records.clone()),
            usage: (!self.usage.is_zero()).then(|| self.usage.into()),
        }
    }

    /// Hand back the current turn and start a fresh one.
    pub fn take(&mut self) -> Accumulation {
        std::mem::take(self)
    }
}
