//! Events emitted while the agent works.
//!
//! The caller hands the agent an `mpsc::Sender<AgentEvent>` and renders
//! whatever arrives. A dropped receiver never interrupts a turn.

use serde::{Deserialize, Serialize};

/// Events emitted by the agent during a conversation.
///
/// - `assistant`: assistant text (a streamed delta or a whole message)
/// - `tool_call`: the model asked for a tool
/// - `tool_result`: the call executed, failed, or was skipped
/// - `compact_start` / `compact_end`: history compaction
/// - `stopped`: a middleware ended the conversation
/// - `user_cancelled`: the caller interrupted the turn
/// - `error`: the turn failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Assistant { content: String },

    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: serde_json::Value,
    },

    ToolResult {
        tool_call_id: String,
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default)]
        skipped: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skip_reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },

    CompactStart {
        current_context_tokens: u32,
        threshold: u32,
    },

    CompactEnd {
        old_context_tokens: u32,
        new_context_tokens: u32,
        summary_length: usize,
    },

    Stopped { reason: String },

    UserCancelled { reason: String },

    Error { message: String },
}

impl AgentEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Assistant { .. } => "assistant",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::CompactStart { .. } => "compact_start",
            Self::CompactEnd { .. } => "compact_end",
            Self::Stopped { .. } => "stopped",
            Self::UserCancelled { .. } => "user_cancelled",
            Self::Error { .. } => "error",
        }
    }

    pub(crate) fn skipped(tool_call_id: &str, tool_name: &str, reason: &str) -> Self {
        Self::ToolResult {
            tool_call_id: tool_call_id.to_string(),
            tool_name: tool_name.to_string(),
            output: None,
            error: None,
            skipped: true,
            skip_reason: Some(reason.to_string()),
            duration_ms: None,
        }
    }

    pub(crate) fn failed(tool_call_id: &str, tool_name: &str, error: String, duration_ms: Option<u64>) -> Self {
        Self::ToolResult {
            tool_call_id: tool_call_id.to_string(),
            tool_name: tool_name.to_string(),
            output: None,
            error: Some(error),
            skipped: false,
            skip_reason: None,
            duration_ms,
        }
    }
}
