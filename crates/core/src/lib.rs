//! # Tiller Core
//!
//! Domain types, traits, and error definitions for the tiller agent core.
//! Everything the turn loop talks to is defined here as a trait; concrete
//! backends, tools, and session stores live in their own crates.
//!
//! ## Layout
//!
//! - [`message`]: the Chunk/Message vocabulary shared by every component
//! - [`backend`]: the adapter contract every provider implements
//! - [`tool`]: the tool capability interface and the catalog that holds tools
//! - [`approval`] and [`session`]: collaborators injected into the agent
//! - [`agent`]: execution modes and session statistics

pub mod error;
pub mod message;
pub mod backend;
pub mod tool;
pub mod approval;
pub mod session;
pub mod agent;

// Re-export key types at crate root for ergonomics
pub use error::{BackendError, BackendErrorKind, CancelReason, Error, PayloadSummary, Result, ToolError};
pub use message::{FunctionCall, Message, Role, ToolCall};
pub use backend::{Backend, Chunk, ChunkReceiver, CompletionRequest, ToolChoice, ToolDefinition, Usage};
pub use tool::{Tool, ToolKind, ToolPermission, ToolRegistry, ToolResult, ToolSettings};
pub use approval::{ApprovalResponse, Approver};
pub use session::{SessionError, SessionHandle, SessionId, SessionMetadata, SessionSnapshot, SessionStore};
pub use agent::{AgentMode, AgentStats};
