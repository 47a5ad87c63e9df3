//! The agent turn loop, the control core of tiller.
//!
//! Each user message is appended, the history is **repaired** so it satisfies
//! the provider contracts, and then one or more **turns** run:
//!
//! 1. **Consult** the middleware pipeline (stop, compact, inject)
//! 2. **Call** the backend, reassembling streamed chunks into one message
//! 3. **Resolve** tool calls one by one: mode, patterns, permission, approver
//! 4. **Persist** the session and loop until the model is done
//!
//! The history itself lives in [`MessageManager`], which is the only code
//! allowed to change it.

pub mod agent;
pub mod events;
pub mod message_manager;
pub mod middleware;
pub mod prompts;
pub mod reassembly;
pub mod resolution;
pub mod tags;

pub use agent::{Agent, TurnOutcome};
pub use events::AgentEvent;
pub use message_manager::{MessageManager, MessageObserver};
pub use middleware::{
    AutoCompact, ContextWarning, ConversationContext, Middleware, MiddlewareAction, MiddlewarePipeline,
    MiddlewareResult, PlanModeReminder, PriceLimit, ResetReason, TurnLimit,
};
pub use prompts::{COMPACT_PROMPT, DefaultPromptBuilder, PromptBuilder};
pub use reassembly::{AssembledResponse, StreamAssembler};
pub use resolution::{
    FailedCall, ParsedCall, ResolvedCall, ToolDecision, ToolResolver, Verdict, assign_missing_ids, parse_tool_calls,
};
