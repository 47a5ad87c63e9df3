//! Generic REST + SSE backend.
//!
//! Speaks the OpenAI-style chat completions format that Mistral, llama.cpp,
//! vLLM, and most hosted gateways expose: a JSON body posted to
//! `{base}/chat/completions`, and for streaming a `text/event-stream` whose
//! `data` fields are JSON chunks terminated by `data: [DONE]`.
//!
//! Tool-call deltas are forwarded as-is, keyed by their `index`; stitching
//! them into whole calls is the caller's job.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tiller_core::backend::*;
use tiller_core::error::{BackendError, BackendErrorKind};
use tiller_core::message::{FunctionCall, Message, Role, ToolCall};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::classify::RequestTarget;
use crate::retry::RetryPolicy;
use crate::sse::SseDecoder;

const COMPLETIONS_PATH: &str = "/chat/completions";

pub struct GenericBackend {
    name: String,
    base_url: String,
    api_key: Option<String>,
    /// Env var the key should have come from, for the not-configured message
    api_key_env_var: Option<String>,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl GenericBackend {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            api_key_env_var: None,
            client,
            retry: RetryPolicy::default(),
        }
    }

    /// Require a key; calls fail with `NotConfigured` naming `env_var` when it is missing.
    pub fn requiring_key(mut self, env_var: impl Into<String>) -> Self {
        self.api_key_env_var = Some(env_var.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, COMPLETIONS_PATH)
    }

    fn check_key(&self, target: &RequestTarget) -> Result<(), BackendError> {
        match (&self.api_key, &self.api_key_env_var) {
            (None, Some(var)) => Err(target.error(BackendErrorKind::NotConfigured(format!(
                "no API key for provider '{}'; set {var}",
                self.name
            )))),
            _ => Ok(()),
        }
    }

    fn build_body(request: &CompletionRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": to_api_messages(&request.messages),
            "temperature": request.temperature,
            "stream": stream,
        });

        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(to_api_tools(&request.tools));
        }

        if let Some(choice) = &request.tool_choice {
            body["tool_choice"] = tool_choice_json(choice);
        }

        body
    }

    async fn post(
        &self,
        request: &CompletionRequest,
        stream: bool,
        target: &RequestTarget,
    ) -> Result<reqwest::Response, BackendError> {
        self.check_key(target)?;
        let body = Self::build_body(request, stream);
        let url = self.endpoint();

        debug!(provider = %self.name, model = %request.model, stream, "Sending completion request");

        self.retry
            .send(target, || {
                let mut builder = self
                    .client
                    .post(&url)
                    .header("Content-Type", "application/json")
                    .json(&body);
                if let Some(key) = &self.api_key {
                    builder = builder.header("Authorization", format!("Bearer {key}"));
                }
                if stream {
                    builder = builder.header("Accept", "text/event-stream");
                }
                for (name, value) in &request.headers {
                    builder = builder.header(name.as_str(), value.as_str());
                }
                builder
            })
            .await
    }
}

#[async_trait]
impl Backend for GenericBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Chunk, BackendError> {
        let target = RequestTarget::new(&self.name, &self.endpoint(), &request.model, &request.messages);
        let response = self.post(&request, false, &target).await?;

        let api_response: ApiResponse = response.json().await.map_err(|e| {
            target.error(BackendErrorKind::MalformedResponse(format!("Failed to parse response: {e}")))
        })?;

        let choice = api_response.choices.into_iter().next().ok_or_else(|| {
            target.error(BackendErrorKind::MalformedResponse("No choices in response".into()))
        })?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                index: None,
                function: FunctionCall {
                    name: tc.function.name,
                    arguments: arguments_text(tc.function.arguments),
                },
            })
            .collect();

        Ok(Chunk {
            message: Message {
                role: Role::Assistant,
                content: choice.message.content.as_ref().and_then(content_text),
                tool_calls,
                tool_call_id: None,
                name: None,
            },
            usage: api_response.usage.map(Into::into),
            finish_reason: choice.finish_reason,
        })
    }

    async fn complete_streaming(&self, request: CompletionRequest) -> Result<ChunkReceiver, BackendError> {
        let target = RequestTarget::new(&self.name, &self.endpoint(), &request.model, &request.messages);
        let response = self.post(&request, true, &target).await?;

        let (tx, rx) = mpsc::channel(64);

        // Spawn task to read the SSE byte stream and forward chunks
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut decoder = SseDecoder::new();

            loop {
                let next = tokio::select! {
                    _ = tx.closed() => {
                        debug!(provider = %target.provider, "Stream receiver dropped, closing connection");
                        return;
                    }
                    next = byte_stream.next() => next,
                };
                let events = match &next {
                    Some(Ok(bytes)) => decoder.push(bytes),
                    Some(Err(e)) => {
                        let _ = tx
                            .send(Err(target.error(BackendErrorKind::StreamInterrupted(e.to_string()))))
                            .await;
                        return;
                    }
                    None => decoder.finish().into_iter().collect(),
                };

                for event in events {
                    if event.is_done() {
                        return;
                    }
                    match parse_stream_data(&event.data) {
                        StreamItem::Chunk(chunk) => {
                            if tx.send(Ok(*chunk)).await.is_err() {
                                debug!(provider = %target.provider, "Stream receiver dropped");
                                return;
                            }
                        }
                        StreamItem::Empty => {}
                        StreamItem::ProviderError(message) => {
                            let _ = tx
                                .send(Err(target.error(BackendErrorKind::StreamInterrupted(message))))
                                .await;
                            return;
                        }
                        StreamItem::Unparseable(e) => {
                            warn!(provider = %target.provider, error = %e, "Ignoring unparseable SSE chunk");
                        }
                    }
                }

                if next.is_none() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}

/// What one SSE `data` payload turned into.
#[derive(Debug)]
pub(crate) enum StreamItem {
    Chunk(Box<Chunk>),
    Empty,
    ProviderError(String),
    Unparseable(String),
}

pub(crate) fn parse_stream_data(data: &str) -> StreamItem {
    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return StreamItem::Unparseable(e.to_string()),
    };

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return StreamItem::ProviderError(message);
    }

    let parsed: StreamResponse = match serde_json::from_value(value) {
        Ok(p) => p,
        Err(e) => return StreamItem::Unparseable(e.to_string()),
    };

    let mut message = Message::empty(Role::Assistant);
    let mut finish_reason = None;

    if let Some(choice) = parsed.choices.into_iter().next() {
        message.content = choice.delta.content.as_ref().and_then(content_text);
        message.tool_calls = choice
            .delta
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|delta| {
                let function = delta.function.unwrap_or_default();
                ToolCall {
                    id: delta.id,
                    index: delta.index,
                    function: FunctionCall {
                        name: function.name,
                        arguments: function.arguments.unwrap_or_default(),
                    },
                }
            })
            .collect();
        finish_reason = choice.finish_reason;
    }

    let usage = parsed.usage.map(Usage::from);
    if message.content.is_none() && message.tool_calls.is_empty() && finish_reason.is_none() && usage.is_none() {
        return StreamItem::Empty;
    }

    StreamItem::Chunk(Box::new(Chunk {
        message,
        usage,
        finish_reason,
    }))
}

/// Text from a `content` field that may be a string or a list of typed parts.
fn content_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(parts) => {
            let text: String = parts
                .iter()
                .filter(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect();
            (!text.is_empty()).then_some(text)
        }
        _ => None,
    }
}

/// Arguments arrive as a JSON string from most providers, as an object from a few.
fn arguments_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn tool_choice_json(choice: &ToolChoice) -> serde_json::Value {
    match choice {
        ToolChoice::Auto => "auto".into(),
        ToolChoice::None => "none".into(),
        ToolChoice::Any => "any".into(),
        ToolChoice::Required => "required".into(),
        ToolChoice::Tool(name) => serde_json::json!({
            "type": "function",
            "function": { "name": name }
        }),
    }
}

fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
    messages
        .iter()
        .map(|m| ApiMessage {
            role: m.role.to_string(),
            content: m.content.clone(),
            tool_calls: if m.tool_calls.is_empty() {
                None
            } else {
                Some(
                    m.tool_calls
                        .iter()
                        .map(|tc| ApiToolCall {
                            id: tc.id.clone().unwrap_or_default(),
                            r#type: "function".into(),
                            function: ApiFunction {
                                name: tc.function.name.clone().unwrap_or_default(),
                                arguments: tc.function.arguments.clone(),
                            },
                        })
                        .collect(),
                )
            },
            tool_call_id: m.tool_call_id.clone(),
            name: m.name.clone(),
        })
        .collect()
}

fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
    tools
        .iter()
        .map(|t| ApiToolDefinition {
            r#type: "function".into(),
            function: ApiToolFunction {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            },
        })
        .collect()
}

// --- Wire types (internal) ---

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    #[serde(default)]
    content: Option<serde_json::Value>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiResponseToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ApiResponseToolCall {
    #[serde(default)]
    id: Option<String>,
    function: ApiResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ApiResponseFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        }
    }
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<serde_json::Value>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta. `index` is optional on the wire so a missing one
/// reaches the reassembler, which rejects it.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
