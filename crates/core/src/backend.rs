//! Backend trait: the adapter contract every model provider implements.
//!
//! A backend turns the internal message model into a provider's wire format
//! and back, owning transport, retries, and error classification. Streaming
//! reassembly is not its job: streamed chunks carry raw deltas and the caller
//! stitches them together.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::BackendError;
use crate::message::Message;

/// A tool definition sent to the model so it knows what it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// How the model may pick tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    None,
    Any,
    Required,
    /// Force a specific tool by name
    Tool(String),
}

/// Everything a backend needs for one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Provider-side model identifier
    pub model: String,

    pub messages: Vec<Message>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Extra request headers (session affinity, tracing ids)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

fn default_temperature() -> f32 {
    0.2
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: default_temperature(),
            tools: Vec::new(),
            tool_choice: None,
            max_tokens: None,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        if !tools.is_empty() {
            self.tool_choice = Some(ToolChoice::Auto);
        }
        self.tools = tools;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// One unit of model output, whole or streamed.
///
/// A non-streaming call yields exactly one chunk with `usage` and
/// `finish_reason` set. A stream yields many; only the last one carries a
/// definitive `finish_reason` and usage only ever appears on the final chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub message: Message,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Receiving end of a streamed completion. Dropping it stops the transport.
pub type ChunkReceiver = mpsc::Receiver<std::result::Result<Chunk, BackendError>>;

/// The core Backend trait.
///
/// The agent calls `complete()` or `complete_streaming()` without knowing which
/// provider sits behind it.
#[async_trait]
pub trait Backend: Send + Sync {
    /// A human-readable name for this backend (e.g., "mistral", "anthropic").
    fn name(&self) -> &str;

    /// Send a request and get a complete response as a single chunk.
    async fn complete(&self, request: CompletionRequest) -> std::result::Result<Chunk, BackendError>;

    /// Send a request and get a finite, non-restartable sequence of chunks.
    ///
    /// Default implementation calls `complete()` and yields its result as the only chunk.
    async fn complete_streaming(
        &self,
        request: CompletionRequest,
    ) -> std::result::Result<ChunkReceiver, BackendError> {
        let chunk = self.complete(request).await?;
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.send(Ok(chunk)).await;
        Ok(rx)
    }

    /// Count prompt tokens by running the same request capped at one output token.
    async fn count_tokens(&self, request: CompletionRequest) -> std::result::Result<u32, BackendError> {
        let model = request.model.clone();
        let payload = crate::error::PayloadSummary::of(&request.messages);
        let chunk = self.complete(request.with_max_tokens(1)).await?;
        chunk.usage.map(|u| u.prompt_tokens).ok_or_else(|| BackendError {
            provider: self.name().to_string(),
            endpoint: "count_tokens".into(),
            model,
            payload,
            kind: crate::error::BackendErrorKind::MalformedResponse(
                "token count response carried no usage".into(),
            ),
        })
    }
}
