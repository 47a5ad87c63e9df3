//! Anthropic backend over a native Messages API client.
//!
//! [`MessagesClient`] is the provider-shaped layer: it owns transport, the
//! `x-api-key`/`anthropic-version` headers, retries, and yields Anthropic's
//! own typed [`StreamEvent`]s. [`AnthropicBackend`] sits on top and
//! normalizes requests, responses, and events into the shared Chunk model:
//! - system messages become the top-level `system` field
//! - tool replies become `tool_result` blocks inside user turns
//! - `tool_use` blocks and `input_json_delta`s become index-keyed tool-call deltas
//! - `stop_reason` maps onto OpenAI-style finish reasons

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

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8192;

// --- Native client ---

/// Thin client for `POST {base}/messages`.
pub struct MessagesClient {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl MessagesClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            http,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}/messages", self.base_url)
    }

    fn has_key(&self) -> bool {
        self.api_key.is_some()
    }

    async fn send(
        &self,
        request: &MessagesRequest,
        headers: &std::collections::BTreeMap<String, String>,
        target: &RequestTarget,
    ) -> Result<reqwest::Response, BackendError> {
        let url = self.endpoint();
        self.retry
            .send(target, || {
                let mut builder = self
                    .http
                    .post(&url)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .header("Content-Type", "application/json")
                    .json(request);
                if let Some(key) = &self.api_key {
                    builder = builder.header("x-api-key", key);
                }
                if request.stream {
                    builder = builder.header("Accept", "text/event-stream");
                }
                for (name, value) in headers {
                    builder = builder.header(name.as_str(), value.as_str());
                }
                builder
            })
            .await
    }

    /// Create a message and wait for the whole response.
    pub async fn create(
        &self,
        request: &MessagesRequest,
        headers: &std::collections::BTreeMap<String, String>,
        target: &RequestTarget,
    ) -> Result<MessagesResponse, BackendError> {
        let response = self.send(request, headers, target).await?;
        response.json().await.map_err(|e| {
            target.error(BackendErrorKind::MalformedResponse(format!(
                "Failed to parse Anthropic response: {e}"
            )))
        })
    }

    /// Create a message as a stream of typed events.
    pub async fn create_stream(
        &self,
        request: &MessagesRequest,
        headers: &std::collections::BTreeMap<String, String>,
        target: &RequestTarget,
    ) -> Result<mpsc::Receiver<Result<StreamEvent, BackendError>>, BackendError> {
        let response = self.send(request, headers, target).await?;
        let (tx, rx) = mpsc::channel(64);
        let target = target.clone();

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
                    match serde_json::from_str::<StreamEvent>(&event.data) {
                        Ok(parsed) => {
                            if tx.send(Ok(parsed)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, "Ignoring unparseable Anthropic SSE event"),
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

// --- Backend adapter ---

pub struct AnthropicBackend {
    name: String,
    client: MessagesClient,
    api_key_env_var: Option<String>,
}

impl AnthropicBackend {
    pub fn new(name: impl Into<String>, client: MessagesClient) -> Self {
        Self {
            name: name.into(),
            client,
            api_key_env_var: None,
        }
    }

    /// Require a key; calls fail with `NotConfigured` naming `env_var` when it is missing.
    pub fn requiring_key(mut self, env_var: impl Into<String>) -> Self {
        self.api_key_env_var = Some(env_var.into());
        self
    }

    fn target(&self, request: &CompletionRequest) -> Result<RequestTarget, BackendError> {
        let target = RequestTarget::new(&self.name, &self.client.endpoint(), &request.model, &request.messages);
        if let (false, Some(var)) = (self.client.has_key(), &self.api_key_env_var) {
            return Err(target.error(BackendErrorKind::NotConfigured(format!(
                "no API key for provider '{}'; set {var}",
                self.name
            ))));
        }
        Ok(target)
    }

    fn build_request(request: &CompletionRequest, stream: bool) -> MessagesRequest {
        let (system, messages) = extract_system(&request.messages);
        MessagesRequest {
            model: request.model.clone(),
            messages: to_api_messages(&messages),
            system,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: request.temperature,
            tools: to_api_tools(&request.tools),
            tool_choice: request.tool_choice.as_ref().map(tool_choice_json),
            stream,
        }
    }
}

#[async_trait]
impl Backend for AnthropicBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Chunk, BackendError> {
        let target = self.target(&request)?;
        let api_request = Self::build_request(&request, false);
        debug!(provider = %self.name, model = %request.model, "Sending completion request");
        let response = self.client.create(&api_request, &request.headers, &target).await?;
        Ok(response_to_chunk(response))
    }

    async fn complete_streaming(&self, request: CompletionRequest) -> Result<ChunkReceiver, BackendError> {
        let target = self.target(&request)?;
        let api_request = Self::build_request(&request, true);
        debug!(provider = %self.name, model = %request.model, "Sending streaming request");
        let mut events = self.client.create_stream(&api_request, &request.headers, &target).await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut normalizer = EventNormalizer::default();
            loop {
                let item = tokio::select! {
                    _ = tx.closed() => return,
                    item = events.recv() => item,
                };
                let Some(item) = item else {
                    return;
                };
                let event = match item {
                    Ok(event) => event,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                match normalizer.apply(event) {
                    Normalized::Chunk(chunk) => {
                        if tx.send(Ok(chunk)).await.is_err() {
                            return;
                        }
                    }
                    Normalized::Nothing => {}
                    Normalized::Final(chunk) => {
                        let _ = tx.send(Ok(chunk)).await;
                        return;
                    }
                    Normalized::Error(message) => {
                        let _ = tx
                            .send(Err(target.error(BackendErrorKind::StreamInterrupted(message))))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Folds Anthropic stream events into chunks, tracking usage across events.
#[derive(Debug, Default)]
struct EventNormalizer {
    input_tokens: u32,
    output_tokens: u32,
    stop_reason: Option<String>,
}

#[derive(Debug)]
enum Normalized {
    Chunk(Chunk),
    Nothing,
    Final(Chunk),
    Error(String),
}

fn delta_chunk(message: Message) -> Normalized {
    Normalized::Chunk(Chunk {
        message,
        usage: None,
        finish_reason: None,
    })
}

impl EventNormalizer {
    fn apply(&mut self, event: StreamEvent) -> Normalized {
        match event {
            StreamEvent::MessageStart { message } => {
                self.input_tokens = message.usage.input_tokens;
                self.output_tokens = message.usage.output_tokens;
                Normalized::Nothing
            }
            StreamEvent::ContentBlockStart { index, content_block } => match content_block {
                ResponseContentBlock::ToolUse { id, name, .. } => delta_chunk(Message::assistant_with_tools(
                    None,
                    vec![ToolCall {
                        id: Some(id),
                        index: Some(index),
                        function: FunctionCall {
                            name: Some(name),
                            arguments: String::new(),
                        },
                    }],
                )),
                ResponseContentBlock::Text { text } if !text.is_empty() => {
                    delta_chunk(Message::assistant(text))
                }
                _ => Normalized::Nothing,
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => delta_chunk(Message::assistant(text)),
                BlockDelta::InputJsonDelta { partial_json } => {
                    delta_chunk(Message::assistant_with_tools(None, vec![ToolCall::delta(index, partial_json)]))
                }
                _ => Normalized::Nothing,
            },
            StreamEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason;
                }
                if let Some(usage) = usage {
                    self.output_tokens = usage.output_tokens;
                }
                Normalized::Nothing
            }
            StreamEvent::MessageStop => Normalized::Final(Chunk {
                message: Message::empty(Role::Assistant),
                usage: Some(Usage {
                    prompt_tokens: self.input_tokens,
                    completion_tokens: self.output_tokens,
                }),
                finish_reason: Some(map_stop_reason(self.stop_reason.as_deref())),
            }),
            StreamEvent::Error { error } => Normalized::Error(error.message),
            StreamEvent::ContentBlockStop { .. } | StreamEvent::Ping | StreamEvent::Unknown => {
                Normalized::Nothing
            }
        }
    }
}

fn map_stop_reason(reason: Option<&str>) -> String {
    match reason {
        None | Some("end_turn") | Some("stop_sequence") => "stop".into(),
        Some("tool_use") => "tool_calls".into(),
        Some("max_tokens") => "length".into(),
        Some(other) => other.to_string(),
    }
}

fn response_to_chunk(resp: MessagesResponse) -> Chunk {
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for block in resp.content {
        match block {
            ResponseContentBlock::Text { text: t } => text.push_str(&t),
            ResponseContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id: Some(id),
                index: None,
                function: FunctionCall {
                    name: Some(name),
                    arguments: input.to_string(),
                },
            }),
            ResponseContentBlock::Thinking { .. } | ResponseContentBlock::Other => {}
        }
    }

    Chunk {
        message: Message::assistant_with_tools((!text.is_empty()).then_some(text), tool_calls),
        usage: Some(Usage {
            prompt_tokens: resp.usage.input_tokens,
            completion_tokens: resp.usage.output_tokens,
        }),
        finish_reason: Some(map_stop_reason(resp.stop_reason.as_deref())),
    }
}

/// Anthropic puts the system prompt in a top-level field, not in messages.
fn extract_system(messages: &[Message]) -> (Option<String>, Vec<&Message>) {
    let mut system_parts: Vec<&str> = Vec::new();
    let mut rest: Vec<&Message> = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => system_parts.push(msg.text()),
            _ => rest.push(msg),
        }
    }

    let system = (!system_parts.is_empty()).then(|| system_parts.join("\n\n"));
    (system, rest)
}

/// Convert to content-block messages, merging consecutive same-role turns
/// (several tool results become one user turn).
fn to_api_messages(messages: &[&Message]) -> Vec<ApiMessage> {
    let mut result: Vec<ApiMessage> = Vec::new();

    for msg in messages {
        let (role, blocks) = match msg.role {
            Role::User => ("user", text_block(msg.text())),
            Role::Assistant => {
                let mut blocks = text_block(msg.text());
                for tc in &msg.tool_calls {
                    let input = serde_json::from_str(&tc.function.arguments)
                        .unwrap_or_else(|_| serde_json::json!({}));
                    blocks.push(ContentBlock::ToolUse {
                        id: tc.id.clone().unwrap_or_default(),
                        name: tc.function.name.clone().unwrap_or_default(),
                        input,
                    });
                }
                ("assistant", blocks)
            }
            Role::Tool => (
                "user",
                vec![ContentBlock::ToolResult {
                    tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                    content: msg.text().to_string(),
                }],
            ),
            Role::System => continue,
        };

        if blocks.is_empty() {
            continue;
        }

        match result.last_mut() {
            Some(last) if last.role == role => last.content.extend(blocks),
            _ => result.push(ApiMessage {
                role: role.to_string(),
                content: blocks,
            }),
        }
    }

    result
}

fn text_block(text: &str) -> Vec<ContentBlock> {
    if text.trim().is_empty() {
        Vec::new()
    } else {
        vec![ContentBlock::Text { text: text.to_string() }]
    }
}

fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiTool> {
    tools
        .iter()
        .map(|t| ApiTool {
            name: t.name.clone(),
            description: t.description.clone(),
            input_schema: t.parameters.clone(),
        })
        .collect()
}

fn tool_choice_json(choice: &ToolChoice) -> serde_json::Value {
    match choice {
        ToolChoice::Auto => serde_json::json!({ "type": "auto" }),
        ToolChoice::None => serde_json::json!({ "type": "none" }),
        ToolChoice::Any | ToolChoice::Required => serde_json::json!({ "type": "any" }),
        ToolChoice::Tool(name) => serde_json::json!({ "type": "tool", "name": name }),
    }
}

// --- Anthropic API types ---

#[derive(Debug, Serialize)]
pub struct MessagesRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: serde_json::Value },
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Debug, Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct MessagesResponse {
    content: Vec<ResponseContentBlock>,
    usage: ApiUsage,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Events of a streamed Messages response.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: StreamMessageStart,
    },
    ContentBlockStart {
        index: u32,
        content_block: ResponseContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    ContentBlockStop {
        #[allow(dead_code)]
        index: u32,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<DeltaUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: StreamErrorBody,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct StreamMessageStart {
    #[serde(default)]
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeltaUsage {
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
pub struct StreamErrorBody {
    #[serde(default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(server: &MockServer) -> AnthropicBackend {
        let client = MessagesClient::new(format!("{}/v1", server.uri()), Some("sk-ant-test".into()), reqwest::Client::new())
            .with_retry(RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            });
        AnthropicBackend::new("anthropic", client)
    }

    #[test]
    fn system_extraction() {
        let messages = vec![
            Message::system("You are helpful"),
            Message::system("Be concise"),
            Message::user("Hello"),
            Message::assistant("Hi!"),
        ];

        let (system, rest) = extract_system(&messages);
        assert_eq!(system.as_deref(), Some("You are helpful\n\nBe concise"));
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].role, Role::User);
    }

    #[test]
    fn tool_results_merge_into_one_user_turn() {
        let messages = vec![
            Message::user("look at both"),
            Message::assistant_with_tools(
                Some("Reading.".into()),
                vec![
                    ToolCall::new("toolu_1", "read_file", r#"{"path":"a"}"#),
                    ToolCall::new("toolu_2", "read_file", r#"{"path":"b"}"#),
                ],
            ),
            Message::tool_result("toolu_1", Some("read_file".into()), "A"),
            Message::tool_result("toolu_2", Some("read_file".into()), "B"),
        ];
        let refs: Vec<&Message> = messages.iter().collect();
        let api = to_api_messages(&refs);
        assert_eq!(api.len(), 3);
        assert_eq!(api[1].role, "assistant");
        assert_eq!(api[1].content.len(), 3);
        assert_eq!(api[2].role, "user");
        assert_eq!(api[2].content.len(), 2);

        let json = serde_json::to_value(&api[2]).unwrap();
        assert_eq!(json["content"][1]["type"], "tool_result");
        assert_eq!(json["content"][1]["tool_use_id"], "toolu_2");
        let assistant = serde_json::to_value(&api[1]).unwrap();
        assert_eq!(assistant["content"][1]["input"]["path"], "a");
    }

    #[test]
    fn empty_assistant_text_is_dropped() {
        let messages = vec![Message::user("hi"), Message::assistant("")];
        let refs: Vec<&Message> = messages.iter().collect();
        assert_eq!(to_api_messages(&refs).len(), 1);
    }

    #[test]
    fn parse_tool_use_response() {
        let resp: MessagesResponse = serde_json::from_str(
            r#"{
                "id": "msg_02",
                "model": "claude-sonnet-4-5",
                "content": [
                    {"type": "thinking", "thinking": "hmm", "signature": "x"},
                    {"type": "text", "text": "Let me check"},
                    {"type": "tool_use", "id": "toolu_abc", "name": "bash", "input": {"command": "ls"}}
                ],
                "usage": {"input_tokens": 20, "output_tokens": 10},
                "stop_reason": "tool_use"
            }"#,
        )
        .unwrap();

        let chunk = response_to_chunk(resp);
        assert_eq!(chunk.message.content.as_deref(), Some("Let me check"));
        assert_eq!(chunk.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(chunk.usage, Some(Usage { prompt_tokens: 20, completion_tokens: 10 }));
        let args: serde_json::Value = serde_json::from_str(&chunk.message.tool_calls[0].function.arguments).unwrap();
        assert_eq!(args["command"], "ls");
    }

    #[test]
    fn stop_reasons_map() {
        assert_eq!(map_stop_reason(Some("end_turn")), "stop");
        assert_eq!(map_stop_reason(Some("max_tokens")), "length");
        assert_eq!(map_stop_reason(Some("refusal")), "refusal");
        assert_eq!(map_stop_reason(None), "stop");
    }

    #[tokio::test]
    async fn complete_sends_native_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-ant-test"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .and(body_partial_json(serde_json::json!({"system": "sys", "max_tokens": 1})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{"type": "text", "text": "x"}],
                "usage": {"input_tokens": 42, "output_tokens": 1},
                "stop_reason": "max_tokens"
            })))
            .mount(&server)
            .await;

        let tokens = backend(&server)
            .count_tokens(CompletionRequest::new("claude", vec![Message::system("sys"), Message::user("hi")]))
            .await
            .unwrap();
        assert_eq!(tokens, 42);
    }

    #[tokio::test]
    async fn streaming_normalizes_events() {
        let server = MockServer::start().await;
        let sse = concat!(
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"usage\":{\"input_tokens\":25,\"output_tokens\":1}}}\n\n",
            "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
            "event: ping\ndata: {\"type\":\"ping\"}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Checking\"}}\n\n",
            "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
            "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_1\",\"name\":\"bash\",\"input\":{}}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"command\\\":\"}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"\\\"ls\\\"}\"}}\n\n",
            "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":1}\n\n",
            "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"},\"usage\":{\"output_tokens\":31}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_partial_json(serde_json::json!({"stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let mut rx = backend(&server)
            .complete_streaming(CompletionRequest::new("claude", vec![Message::user("ls")]))
            .await
            .unwrap();
        let mut chunks = Vec::new();
        while let Some(item) = rx.recv().await {
            chunks.push(item.unwrap());
        }

        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[0].message.content.as_deref(), Some("Checking"));
        let seed = &chunks[1].message.tool_calls[0];
        assert_eq!(seed.index, Some(1));
        assert_eq!(seed.id.as_deref(), Some("toolu_1"));
        assert_eq!(seed.name(), Some("bash"));
        assert_eq!(chunks[2].message.tool_calls[0].function.arguments, "{\"command\":");
        assert_eq!(chunks[3].message.tool_calls[0].function.arguments, "\"ls\"}");
        let last = chunks.last().unwrap();
        assert_eq!(last.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(last.usage, Some(Usage { prompt_tokens: 25, completion_tokens: 31 }));
    }

    #[tokio::test]
    async fn stream_error_event_surfaces() {
        let server = MockServer::start().await;
        let sse = "event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n";
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let mut rx = backend(&server)
            .complete_streaming(CompletionRequest::new("claude", vec![Message::user("hi")]))
            .await
            .unwrap();
        let err = rx.recv().await.unwrap().unwrap_err();
        assert!(matches!(err.kind, BackendErrorKind::StreamInterrupted(ref m) if m == "Overloaded"));
    }

    #[tokio::test]
    async fn missing_key_is_not_configured() {
        let client = MessagesClient::new("http://127.0.0.1:9", None, reqwest::Client::new());
        let backend = AnthropicBackend::new("anthropic", client).requiring_key("ANTHROPIC_API_KEY");
        let err = backend
            .complete(CompletionRequest::new("claude", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err.kind, BackendErrorKind::NotConfigured(_)));
    }

    #[tokio::test]
    async fn dropping_receiver_closes_the_connection() {
        let frame = "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n";
        let (url, server) = crate::test_support::hanging_sse_server(frame).await;
        let client = MessagesClient::new(format!("{url}/v1"), Some("sk-ant-test".into()), reqwest::Client::new());
        let backend = AnthropicBackend::new("anthropic", client);

        let mut rx = backend
            .complete_streaming(CompletionRequest::new("claude", vec![Message::user("hi")]))
            .await
            .unwrap();
        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.message.content.as_deref(), Some("Hi"));

        drop(rx);
        tokio::time::timeout(crate::test_support::CLOSE_TIMEOUT, server)
            .await
            .expect("connection still open after the receiver was dropped")
            .unwrap();
    }
}
