//! Error types for the tiller domain.
//!
//! Uses `thiserror` for ergonomic error definitions. [`Error`] is the tagged
//! result of a turn: callers match on protocol, backend, cancellation, and
//! the rest instead of inspecting messages.

use thiserror::Error;

use crate::message::Message;
use crate::session::SessionError;

/// The top-level error type for all tiller operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Adapter contract violations ---
    #[error("Protocol error: {0}")]
    Protocol(String),

    // --- Backend errors (after retries) ---
    #[error(transparent)]
    Backend(#[from] BackendError),

    // --- Cancellation ---
    #[error("Cancelled: {0}")]
    Cancelled(CancelReason),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Middleware misuse ---
    #[error("Middleware error: {0}")]
    Middleware(String),

    // --- Session persistence ---
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Where an interruption came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller cancelled while the model was streaming
    UserDuringStream,
    /// The caller cancelled while a tool was running
    UserDuringTool,
    /// The process itself was interrupted while a tool was running
    Interrupted,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::UserDuringStream => f.write_str("user cancelled during model response"),
            CancelReason::UserDuringTool => f.write_str("user cancelled during tool execution"),
            CancelReason::Interrupted => f.write_str("interrupted during tool execution"),
        }
    }
}

// --- Bounded context errors ---

/// Approximate size of a request, safe to log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayloadSummary {
    pub messages: usize,
    pub approx_chars: usize,
}

impl PayloadSummary {
    pub fn of(messages: &[Message]) -> Self {
        Self {
            messages: messages.len(),
            approx_chars: messages.iter().map(Message::approx_chars).sum(),
        }
    }
}

impl std::fmt::Display for PayloadSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} messages, ~{} chars", self.messages, self.approx_chars)
    }
}

#[derive(Debug, Clone, Error)]
pub enum BackendErrorKind {
    #[error("API request failed: {message} (status: {status_code})")]
    Api { status_code: u16, message: String },

    #[error("Rate limited by provider{}", .retry_after_secs.map(|s| format!(", retry after {s}s")).unwrap_or_default())]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Prompt exceeds the model context window: {0}")]
    ContextTooLong(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// A classified backend failure with enough context to act on.
#[derive(Debug, Clone, Error)]
#[error("{provider} request to {endpoint} (model {model}, {payload}) failed: {kind}")]
pub struct BackendError {
    pub provider: String,
    pub endpoint: String,
    pub model: String,
    pub payload: PayloadSummary,
    pub kind: BackendErrorKind,
}

impl BackendError {
    pub fn is_context_too_long(&self) -> bool {
        matches!(self.kind, BackendErrorKind::ContextTooLong(_))
    }

    /// Transient failures: network, timeouts, 5xx and rate limits.
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            BackendErrorKind::Network(_)
            | BackendErrorKind::Timeout(_)
            | BackendErrorKind::RateLimited { .. } => true,
            BackendErrorKind::Api { status_code, .. } => *status_code >= 500,
            _ => false,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self.kind {
            BackendErrorKind::RateLimited { retry_after_secs } => retry_after_secs,
            _ => None,
        }
    }

    /// Text to show the user instead of the raw error, if any applies.
    pub fn recovery_hint(&self) -> Option<String> {
        match &self.kind {
            BackendErrorKind::ContextTooLong(_) => Some(format!(
                "The conversation ({}) no longer fits in the context window of {}. \
                 Compact the conversation or clear the history, then retry.",
                self.payload, self.model
            )),
            BackendErrorKind::AuthenticationFailed(_) | BackendErrorKind::NotConfigured(_) => Some(
                format!("Check the API key configured for provider '{}'.", self.provider),
            ),
            BackendErrorKind::RateLimited { .. } => {
                Some("The provider is rate limiting requests. Wait a moment and retry.".into())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Permission denied: {tool_name}: {reason}")]
    PermissionDenied { tool_name: String, reason: String },

    #[error("Sandbox violation: {0}")]
    SandboxViolation(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool interrupted: {0}")]
    Interrupted(String),
}

impl ToolError {
    /// Permission failures are counted as rejections, not failures.
    pub fn is_permission(&self) -> bool {
        matches!(self, ToolError::PermissionDenied { .. } | ToolError::SandboxViolation(_))
    }
}
