//! Execution modes and session statistics.

use serde::{Deserialize, Serialize};

use crate::backend::Usage;
use crate::tool::{Tool, ToolKind};

/// A named execution policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    /// Ask according to tool permissions (default)
    #[default]
    Default,
    /// Read-only planning: every call with side effects is blocked
    Plan,
    /// File edits are approved without asking
    AcceptEdits,
    /// Every call that is not blocked executes
    AutoApprove,
}

impl AgentMode {
    pub fn auto_approves(&self) -> bool {
        matches!(self, AgentMode::AutoApprove)
    }

    pub fn auto_approves_kind(&self, kind: ToolKind) -> bool {
        matches!(self, AgentMode::AcceptEdits) && kind == ToolKind::Edit
    }

    /// Feedback for a call this mode refuses, `None` if the call may proceed.
    pub fn block_reason(&self, tool: &dyn Tool, arguments: &serde_json::Value) -> Option<String> {
        match self {
            AgentMode::Plan if !tool.is_read_only(arguments) => Some(format!(
                "Tool '{}' is blocked in plan mode. This block is unconditional and no approval \
                 can lift it. Do not retry this call or any equivalent write, edit, or command \
                 with side effects. Use read-only tools such as read_file to investigate, then \
                 present your plan to the user.",
                tool.name()
            )),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentMode::Default => "default",
            AgentMode::Plan => "plan",
            AgentMode::AcceptEdits => "accept_edits",
            AgentMode::AutoApprove => "auto_approve",
        };
        f.write_str(s)
    }
}

/// Counters and token accounting for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    /// User messages sent
    pub steps: u32,
    /// Backend calls made
    pub turns: u32,

    pub session_prompt_tokens: u64,
    pub session_completion_tokens: u64,
    pub last_turn_prompt_tokens: u32,
    pub last_turn_completion_tokens: u32,
    pub last_turn_duration_secs: f64,
    pub tokens_per_second: f64,

    /// Current context size estimate
    pub context_tokens: u32,

    pub tool_calls_agreed: u32,
    pub tool_calls_rejected: u32,
    pub tool_calls_failed: u32,
    pub tool_calls_succeeded: u32,

    /// USD per million prompt tokens
    pub input_price_per_million: f64,
    /// USD per million completion tokens
    pub output_price_per_million: f64,
}

impl AgentStats {
    pub fn with_pricing(input_price_per_million: f64, output_price_per_million: f64) -> Self {
        Self {
            input_price_per_million,
            output_price_per_million,
            ..Default::default()
        }
    }

    /// Fold one backend call into the session totals.
    pub fn record_turn(&mut self, usage: Usage, duration_secs: f64) {
        self.session_prompt_tokens += u64::from(usage.prompt_tokens);
        self.session_completion_tokens += u64::from(usage.completion_tokens);
        self.last_turn_prompt_tokens = usage.prompt_tokens;
        self.last_turn_completion_tokens = usage.completion_tokens;
        self.last_turn_duration_secs = duration_secs;
        self.tokens_per_second = if duration_secs > 0.0 {
            f64::from(usage.completion_tokens) / duration_secs
        } else {
            0.0
        };
        self.context_tokens = usage.total();
    }

    pub fn session_cost(&self) -> f64 {
        (self.session_prompt_tokens as f64 * self.input_price_per_million
            + self.session_completion_tokens as f64 * self.output_price_per_million)
            / 1_000_000.0
    }

    /// Zero everything but keep the pricing.
    pub fn reset(&mut self) {
        *self = Self::with_pricing(self.input_price_per_million, self.output_price_per_million);
    }
}
