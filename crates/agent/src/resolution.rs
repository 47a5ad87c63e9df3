//! Tool resolution: parse the model's calls, decide on each, execute in order.
//!
//! Calls are handled strictly one after another so side effects land in the
//! order the model asked for them and reply N always answers call N.

use std::time::Instant;

use tiller_core::agent::{AgentMode, AgentStats};
use tiller_core::approval::{ApprovalResponse, Approver};
use tiller_core::error::{CancelReason, Error, Result, ToolError};
use tiller_core::message::Message;
use tiller_core::tool::{Tool, ToolPermission, ToolRegistry};
use tiller_security::{PatternPolicy, PatternVerdict};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::AgentEvent;
use crate::message_manager::MessageManager;
use crate::tags;

const SKIPPED_BY_USER: &str = "User skipped the tool call.";

/// A call whose name and arguments checked out.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A call that can never run: unknown tool, missing name, or bad arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedCall {
    pub id: String,
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedCall {
    Valid(ParsedCall),
    Malformed(FailedCall),
}

impl ResolvedCall {
    pub fn id(&self) -> &str {
        match self {
            Self::Valid(call) => &call.id,
            Self::Malformed(call) => &call.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Valid(call) => &call.name,
            Self::Malformed(call) => &call.name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Execute,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDecision {
    pub verdict: Verdict,
    /// Tool reply used when the call is skipped
    pub feedback: Option<String>,
}

impl ToolDecision {
    pub fn execute() -> Self {
        Self {
            verdict: Verdict::Execute,
            feedback: None,
        }
    }

    pub fn skip(feedback: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Skip,
            feedback: Some(feedback.into()),
        }
    }
}

/// Give every call without an id a fresh one. Returns how many were assigned.
///
/// Runs before the assistant message enters history so replies always have
/// an id to point at.
pub fn assign_missing_ids(message: &mut Message) -> usize {
    let mut assigned = 0;
    for call in &mut message.tool_calls {
        if call.id.as_deref().is_none_or(str::is_empty) {
            call.id = Some(format!("call_{}", uuid::Uuid::new_v4().simple()));
            assigned += 1;
        }
    }
    assigned
}

/// Split an assistant message's calls into runnable and malformed ones,
/// keeping the order the model used.
pub fn parse_tool_calls(message: &Message, registry: &ToolRegistry) -> Vec<ResolvedCall> {
    message
        .tool_calls
        .iter()
        .map(|call| {
            let id = call.id.clone().unwrap_or_default();
            let name = call.name().unwrap_or_default().to_string();
            let malformed = |error: String| {
                ResolvedCall::Malformed(FailedCall {
                    id: id.clone(),
                    name: name.clone(),
                    error,
                })
            };

            if name.is_empty() {
                return malformed("tool call has no function name".into());
            }
            if !registry.contains(&name) {
                return malformed(format!("Unknown tool '{name}'"));
            }

            let raw = call.function.arguments.trim();
            let arguments = if raw.is_empty() {
                serde_json::Value::Object(Default::default())
            } else {
                match serde_json::from_str::<serde_json::Value>(raw) {
                    Ok(value) => value,
                    Err(e) => return malformed(format!("invalid JSON arguments: {e}")),
                }
            };
            if !arguments.is_object() {
                return malformed("arguments must be a JSON object".into());
            }

            ResolvedCall::Valid(ParsedCall { id, name, arguments })
        })
        .collect()
}

/// Everything one round of tool resolution reads or updates.
///
/// Borrowed from the agent for the duration of a single assistant turn.
pub struct ToolResolver<'a> {
    pub registry: &'a ToolRegistry,
    pub approver: Option<&'a dyn Approver>,
    pub mode: AgentMode,
    /// Session-wide flag flipped by an `Always` approval
    pub auto_approve: &'a mut bool,
    pub stats: &'a mut AgentStats,
    pub events: &'a mpsc::Sender<AgentEvent>,
    pub cancel: &'a CancellationToken,
}

impl ToolResolver<'_> {
    /// Run every call and append one reply per call.
    ///
    /// A cancellation leaves a reply for the interrupted call and every call
    /// after it, then returns [`Error::Cancelled`].
    pub async fn resolve(&mut self, calls: Vec<ResolvedCall>, history: &mut MessageManager) -> Result<()> {
        let mut pending = calls.into_iter();

        while let Some(call) = pending.next() {
            let outcome = match call {
                ResolvedCall::Malformed(failed) => {
                    self.reject_malformed(failed, history);
                    Ok(())
                }
                ResolvedCall::Valid(call) => self.resolve_one(&call, history).await,
            };

            if let Err(reason) = outcome {
                for rest in pending.by_ref() {
                    history.append(Message::tool_result(
                        rest.id(),
                        Some(rest.name().to_string()),
                        tags::user_cancellation(&format!(
                            "Tool '{}' was not run because the user cancelled.",
                            rest.name()
                        )),
                    ));
                }
                return Err(Error::Cancelled(reason));
            }
        }
        Ok(())
    }

    fn reject_malformed(&mut self, failed: FailedCall, history: &mut MessageManager) {
        warn!(tool = %failed.name, call_id = %failed.id, error = %failed.error, "Malformed tool call");
        self.stats.tool_calls_failed += 1;
        history.append(Message::tool_result(
            &failed.id,
            Some(failed.name.clone()),
            tags::tool_error(&failed.name, &failed.error),
        ));
        self.emit(AgentEvent::failed(&failed.id, &failed.name, failed.error, None));
    }

    async fn resolve_one(
        &mut self,
        call: &ParsedCall,
        history: &mut MessageManager,
    ) -> std::result::Result<(), CancelReason> {
        self.emit(AgentEvent::ToolCall {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.arguments.clone(),
        });

        let decision = match self.decide(call).await {
            Ok(decision) => decision,
            Err(reason) => {
                self.reply_cancelled(call, history);
                return Err(reason);
            }
        };

        match decision.verdict {
            Verdict::Skip => {
                let feedback = decision
                    .feedback
                    .unwrap_or_else(|| tags::user_cancellation(SKIPPED_BY_USER));
                debug!(tool = %call.name, call_id = %call.id, "Tool call skipped");
                self.stats.tool_calls_rejected += 1;
                history.append(Message::tool_result(&call.id, Some(call.name.clone()), &feedback));
                self.emit(AgentEvent::skipped(&call.id, &call.name, &feedback));
                Ok(())
            }
            Verdict::Execute => self.execute(call, history).await,
        }
    }

    /// Decide whether a well-formed call runs.
    ///
    /// Order: mode block, auto-approve, allow/deny patterns, edit
    /// auto-approval, tool permission, and finally the approver. Only a
    /// cancellation while waiting on the approver returns `Err`.
    pub async fn decide(&mut self, call: &ParsedCall) -> std::result::Result<ToolDecision, CancelReason> {
        let Some(tool) = self.registry.get(&call.name) else {
            return Ok(ToolDecision::skip(tags::tool_error(
                &call.name,
                &format!("Unknown tool '{}'", call.name),
            )));
        };

        if let Some(reason) = self.mode.block_reason(tool, &call.arguments) {
            return Ok(ToolDecision::skip(reason));
        }

        if self.mode.auto_approves() || *self.auto_approve {
            return Ok(ToolDecision::execute());
        }

        if let Some(decision) = self.check_patterns(tool, call) {
            return Ok(decision);
        }

        if self.mode.auto_approves_kind(tool.kind()) {
            return Ok(ToolDecision::execute());
        }

        match self.registry.permission(&call.name) {
            ToolPermission::Always => Ok(ToolDecision::execute()),
            ToolPermission::Never => Ok(ToolDecision::skip(format!(
                "Tool '{}' is permanently disabled",
                call.name
            ))),
            ToolPermission::Ask => self.ask(call).await,
        }
    }

    fn check_patterns(&self, tool: &dyn Tool, call: &ParsedCall) -> Option<ToolDecision> {
        let policy = PatternPolicy::from_settings(&call.name, &self.registry.settings(&call.name));
        if policy.is_empty() {
            return None;
        }
        match policy.check(&tool.pattern_subjects(&call.arguments)) {
            PatternVerdict::Denied { pattern, subject } => Some(ToolDecision::skip(format!(
                "Tool '{}' blocked by denylist pattern '{pattern}' (matched '{subject}')",
                call.name
            ))),
            PatternVerdict::Allowed { pattern } => {
                debug!(tool = %call.name, %pattern, "Tool call allowed by allowlist");
                Some(ToolDecision::execute())
            }
            PatternVerdict::NoMatch => None,
        }
    }

    async fn ask(&mut self, call: &ParsedCall) -> std::result::Result<ToolDecision, CancelReason> {
        let Some(approver) = self.approver else {
            return Ok(ToolDecision::skip(format!(
                "Tool '{}' requires approval but no approver is configured",
                call.name
            )));
        };

        let (response, feedback) = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(CancelReason::UserDuringTool),
            answer = approver.ask(&call.name, &call.arguments, &call.id) => answer,
        };

        match response {
            ApprovalResponse::Always => {
                info!(tool = %call.name, "Auto-approve enabled for the rest of the session");
                *self.auto_approve = true;
                Ok(ToolDecision::execute())
            }
            ApprovalResponse::Yes => Ok(ToolDecision::execute()),
            ApprovalResponse::No => Ok(ToolDecision {
                verdict: Verdict::Skip,
                feedback,
            }),
        }
    }

    async fn execute(
        &mut self,
        call: &ParsedCall,
        history: &mut MessageManager,
    ) -> std::result::Result<(), CancelReason> {
        self.stats.tool_calls_agreed += 1;
        info!(tool = %call.name, call_id = %call.id, "Executing tool");

        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = self.registry.invoke(&call.name, call.arguments.clone()) => Some(result),
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let result = match outcome {
            None => {
                warn!(tool = %call.name, "Tool execution cancelled by user");
                self.reply_cancelled(call, history);
                return Err(CancelReason::UserDuringTool);
            }
            Some(Err(ToolError::Interrupted(message))) => {
                warn!(tool = %call.name, %message, "Tool execution interrupted");
                self.reply_cancelled(call, history);
                return Err(CancelReason::Interrupted);
            }
            Some(result) => result,
        };

        let (content, event) = match result {
            Ok(result) if result.success => {
                self.stats.tool_calls_succeeded += 1;
                let event = AgentEvent::ToolResult {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    output: Some(result.output.clone()),
                    error: None,
                    skipped: false,
                    skip_reason: None,
                    duration_ms: Some(duration_ms),
                };
                (result.output, event)
            }
            Ok(result) => {
                self.stats.tool_calls_failed += 1;
                let content = tags::tool_error(&call.name, &result.output);
                (content, AgentEvent::failed(&call.id, &call.name, result.output, Some(duration_ms)))
            }
            Err(e) => {
                if e.is_permission() {
                    self.stats.tool_calls_agreed = self.stats.tool_calls_agreed.saturating_sub(1);
                    self.stats.tool_calls_rejected += 1;
                } else {
                    self.stats.tool_calls_failed += 1;
                }
                warn!(tool = %call.name, error = %e, "Tool execution failed");
                let message = e.to_string();
                let content = tags::tool_error(&call.name, &message);
                (content, AgentEvent::failed(&call.id, &call.name, message, Some(duration_ms)))
            }
        };

        history.append(Message::tool_result(&call.id, Some(call.name.clone()), content));
        self.emit(event);
        Ok(())
    }

    fn reply_cancelled(&mut self, call: &ParsedCall, history: &mut MessageManager) {
        let content = tags::user_cancellation(&format!("Tool '{}' was cancelled by the user.", call.name));
        history.append(Message::tool_result(&call.id, Some(call.name.clone()), &content));
        self.emit(AgentEvent::skipped(&call.id, &call.name, &content));
    }

    fn emit(&self, event: AgentEvent) {
        crate::agent::emit(self.events, event);
    }
}
