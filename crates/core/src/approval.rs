//! The approval collaborator.
//!
//! When neither mode, configuration, nor the session's auto-approve flag
//! settles a tool call, the agent asks an [`Approver`]. The approver is passed
//! into the agent at construction time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalResponse {
    /// Execute and auto-approve everything for the rest of the session
    Always,
    /// Execute this call only
    Yes,
    No,
}

#[async_trait]
pub trait Approver: Send + Sync {
    /// Decide on one call. Feedback is used as the tool reply when the call is refused.
    async fn ask(
        &self,
        tool_name: &str,
        arguments: &serde_json::Value,
        call_id: &str,
    ) -> (ApprovalResponse, Option<String>);
}

/// Approves every call once. Useful for non-interactive runs.
pub struct AlwaysYes;

#[async_trait]
impl Approver for AlwaysYes {
    async fn ask(&self, _: &str, _: &serde_json::Value, _: &str) -> (ApprovalResponse, Option<String>) {
        (ApprovalResponse::Yes, None)
    }
}
