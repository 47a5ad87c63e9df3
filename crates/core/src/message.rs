//! Message and tool-call value types.
//!
//! These are the values that flow through the whole system: the agent appends
//! them to history, backends translate them to wire formats, and streamed
//! chunks carry partial versions of them.

use serde::{Deserialize, Serialize};

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions (always index 0)
    System,
    /// The end user
    User,
    /// The model
    Assistant,
    /// Tool execution result
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        f.write_str(s)
    }
}

/// The function half of a tool call.
///
/// During streaming both fields arrive piecemeal: `name` on the first delta
/// for an index, `arguments` as string fragments to be concatenated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Raw JSON text of the arguments
    #[serde(default)]
    pub arguments: String,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Stream position, only meaningful while reassembling deltas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,

    pub function: FunctionCall,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            index: None,
            function: FunctionCall {
                name: Some(name.into()),
                arguments: arguments.into(),
            },
        }
    }

    /// A streaming fragment for the call at `index`.
    pub fn delta(index: u32, arguments: impl Into<String>) -> Self {
        Self {
            id: None,
            index: Some(index),
            function: FunctionCall {
                name: None,
                arguments: arguments.into(),
            },
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.function.name.as_deref()
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,

    #[serde(default)]
    pub content: Option<String>,

    /// Tool calls requested by the assistant (if any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Set on tool replies: the call being answered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Set on tool replies: the tool that produced the output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    fn with_role(role: Role, content: Option<String>) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, Some(content.into()))
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, Some(content.into()))
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, Some(content.into()))
    }

    /// Create an assistant message that requests tool calls.
    pub fn assistant_with_tools(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::with_role(Role::Assistant, content)
        }
    }

    /// Create a tool result message.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: Option<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            name,
            ..Self::with_role(Role::Tool, Some(content.into()))
        }
    }

    /// An empty partial message, used as the starting point for stream deltas.
    pub fn empty(role: Role) -> Self {
        Self::with_role(role, None)
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Approximate size in characters, used for payload summaries.
    pub fn approx_chars(&self) -> usize {
        self.text().len()
            + self
                .tool_calls
                .iter()
                .map(|c| c.function.arguments.len() + c.name().map_or(0, str::len))
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }

    #[test]
    fn tool_result_carries_call_id() {
        let msg = Message::tool_result("call_7", Some("bash".into()), "ok");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_7"));
        assert_eq!(msg.name.as_deref(), Some("bash"));
    }

    #[test]
    fn empty_tool_calls_are_not_serialized() {
        let json = serde_json::to_value(Message::user("hi")).unwrap();
        assert!(json.get("tool_calls").is_none());
        assert_eq!(json["content"], "hi");
    }

    #[test]
    fn assistant_without_content_roundtrips_null() {
        let msg = Message::assistant_with_tools(None, vec![ToolCall::new("c1", "read_file", "{}")]);
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
        assert!(back.content.is_none());
    }

    #[test]
    fn approx_chars_counts_arguments() {
        let msg = Message::assistant_with_tools(
            Some("abc".into()),
            vec![ToolCall::new("c1", "bash", r#"{"command":"ls"}"#)],
        );
        assert_eq!(msg.approx_chars(), 3 + 4 + 16);
    }
}
