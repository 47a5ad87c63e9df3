//! The turn loop.
//!
//! One call to [`Agent::converse`] appends the user's message, repairs the
//! history, and then runs turns until the model answers without asking for
//! tools:
//!
//! 1. **Run** the middleware `before_turn` hooks
//! 2. **Call** the backend, streamed or whole, and fold the result into one
//!    assistant message
//! 3. **Resolve** any tool calls in order, one reply per call
//! 4. **Persist** the session, then loop or finish
//!
//! A turn is terminal when the last message is not a tool reply and the
//! model reported a finish reason.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tiller_config::{AppConfig, ModelConfig};
use tiller_core::agent::{AgentMode, AgentStats};
use tiller_core::approval::Approver;
use tiller_core::backend::{Backend, CompletionRequest};
use tiller_core::error::{CancelReason, Error, Result};
use tiller_core::message::{Message, Role};
use tiller_core::session::{SessionError, SessionId, SessionMetadata, SessionSnapshot, SessionStore};
use tiller_core::tool::ToolRegistry;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::events::AgentEvent;
use crate::message_manager::{MessageManager, MessageObserver};
use crate::middleware::{ConversationContext, MiddlewareAction, MiddlewarePipeline, MiddlewareResult, ResetReason};
use crate::prompts::{COMPACT_PROMPT, DefaultPromptBuilder, PromptBuilder};
use crate::reassembly::{AssembledResponse, StreamAssembler};
use crate::resolution::{ToolResolver, assign_missing_ids, parse_tool_calls};
use crate::tags;

/// How a `converse` call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model finished; `response` is its last text
    Completed { response: String },
    /// A middleware ended the conversation
    Stopped { reason: String },
}

enum TurnStep {
    Continue,
    Done(TurnOutcome),
}

pub struct Agent {
    backend: Arc<dyn Backend>,
    registry: Arc<ToolRegistry>,
    config: AppConfig,
    model: ModelConfig,
    history: MessageManager,
    middleware: MiddlewarePipeline,
    approver: Option<Arc<dyn Approver>>,
    store: Option<Arc<dyn SessionStore>>,
    mode: AgentMode,
    /// Set by an `Always` approval, independent of `mode`
    auto_approve: bool,
    stats: AgentStats,
    session_id: SessionId,
    start_time: DateTime<Utc>,
}

impl Agent {
    /// Create an agent for the configured active model.
    ///
    /// The middleware pipeline comes from configuration and the system prompt
    /// from [`DefaultPromptBuilder`]; both can be swapped before the first turn.
    pub fn new(config: AppConfig, backend: Arc<dyn Backend>, registry: Arc<ToolRegistry>) -> Result<Self> {
        let model = config.active_model()?.clone();
        let system_prompt = DefaultPromptBuilder.build(&registry, &config);
        let middleware = MiddlewarePipeline::from_config(&config);
        let stats = AgentStats::with_pricing(model.input_price, model.output_price);

        info!(
            model = %model.name,
            backend = backend.name(),
            tools = registry.len(),
            "Agent created"
        );

        Ok(Self {
            backend,
            registry,
            config,
            model,
            history: MessageManager::new(system_prompt),
            middleware,
            approver: None,
            store: None,
            mode: AgentMode::default(),
            auto_approve: false,
            stats,
            session_id: SessionId::new(),
            start_time: Utc::now(),
        })
    }

    pub fn with_approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = Some(approver);
        self
    }

    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_middleware(mut self, middleware: MiddlewarePipeline) -> Self {
        self.middleware = middleware;
        self
    }

    pub fn with_prompt_builder(mut self, builder: &dyn PromptBuilder) -> Self {
        self.history.initialize(builder.build(&self.registry, &self.config));
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn MessageObserver>) -> Self {
        self.history.set_observer(observer);
        self
    }

    pub fn with_mode(mut self, mode: AgentMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn messages(&self) -> &[Message] {
        self.history.messages()
    }

    pub fn stats(&self) -> &AgentStats {
        &self.stats
    }

    pub fn mode(&self) -> AgentMode {
        self.mode
    }

    /// Switch execution mode. Takes effect on the next tool decision.
    pub fn set_mode(&mut self, mode: AgentMode) {
        if mode != self.mode {
            info!(from = %self.mode, to = %mode, "Agent mode changed");
            self.mode = mode;
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn auto_approve(&self) -> bool {
        self.auto_approve
    }

    /// Send one user message and run turns until the model is done.
    ///
    /// Events are sent to `events` as they happen. Cancelling `cancel` stops
    /// a stream or a running tool; the history is left well-formed and the
    /// call returns [`Error::Cancelled`]. The session is persisted before
    /// any error is returned.
    pub async fn converse(
        &mut self,
        text: &str,
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        self.history.append(Message::user(text));
        self.stats.steps += 1;
        let repaired = self.history.repair();
        if repaired > 0 {
            debug!(repaired, "Repaired conversation history");
        }

        let result = self.run_turns(events, cancel).await;
        if let Err(e) = &result {
            if !e.is_cancelled() {
                warn!(error = %e, "Turn failed");
                emit(events, AgentEvent::Error { message: e.to_string() });
            }
            self.persist().await;
        }
        result
    }

    async fn run_turns(
        &mut self,
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        loop {
            let span = info_span!(
                "turn",
                session = %self.session_id.short(),
                turn = self.stats.turns + 1
            );
            let step = self.turn(events, cancel).instrument(span).await?;
            self.persist().await;
            if let TurnStep::Done(outcome) = step {
                return Ok(outcome);
            }
        }
    }

    async fn turn(&mut self, events: &mpsc::Sender<AgentEvent>, cancel: &CancellationToken) -> Result<TurnStep> {
        let before = self.middleware.run_before_turn(&ConversationContext {
            messages: self.history.messages(),
            stats: &self.stats,
            config: &self.config,
            mode: self.mode,
        });
        if let Some(step) = self.apply_middleware(before, events).await? {
            return Ok(step);
        }

        self.stats.turns += 1;
        let started = Instant::now();
        let response = if self.config.enable_streaming {
            self.stream_response(events, cancel).await?
        } else {
            self.whole_response(events, cancel).await?
        };

        let usage = response.usage.ok_or_else(|| {
            Error::Protocol(format!(
                "backend '{}' returned a response without usage",
                self.backend.name()
            ))
        })?;
        self.stats.record_turn(usage, started.elapsed().as_secs_f64());
        debug!(
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            finish_reason = ?response.finish_reason,
            "Model responded"
        );

        let mut message = response.message;
        assign_missing_ids(&mut message);
        let calls = parse_tool_calls(&message, &self.registry);
        let text = message.text().to_string();
        self.history.append(message);

        if !calls.is_empty() {
            let mut resolver = ToolResolver {
                registry: self.registry.as_ref(),
                approver: self.approver.as_deref(),
                mode: self.mode,
                auto_approve: &mut self.auto_approve,
                stats: &mut self.stats,
                events,
                cancel,
            };
            if let Err(e) = resolver.resolve(calls, &mut self.history).await {
                if let Error::Cancelled(reason) = &e {
                    emit(events, AgentEvent::UserCancelled { reason: reason.to_string() });
                }
                return Err(e);
            }
        }

        let after = self.middleware.run_after_turn(&ConversationContext {
            messages: self.history.messages(),
            stats: &self.stats,
            config: &self.config,
            mode: self.mode,
        })?;
        if let Some(step) = self.apply_middleware(after, events).await? {
            return Ok(step);
        }

        let ends_on_tool = self.history.last().is_some_and(|m| m.role == Role::Tool);
        if !ends_on_tool && response.finish_reason.is_some() {
            return Ok(TurnStep::Done(TurnOutcome::Completed { response: text }));
        }
        Ok(TurnStep::Continue)
    }

    /// Act on a middleware result. `Some` ends the conversation.
    async fn apply_middleware(
        &mut self,
        result: MiddlewareResult,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<Option<TurnStep>> {
        match result.action {
            MiddlewareAction::Continue => {}
            MiddlewareAction::Stop => {
                let reason = result.reason.unwrap_or_else(|| "Stopped by middleware".into());
                info!(%reason, "Conversation stopped");
                self.history.apply_injection(&tags::stop_event(&reason));
                emit(events, AgentEvent::Stopped { reason: reason.clone() });
                return Ok(Some(TurnStep::Done(TurnOutcome::Stopped { reason })));
            }
            MiddlewareAction::Compact => {
                let threshold = result
                    .metadata
                    .get("threshold")
                    .and_then(serde_json::Value::as_u64)
                    .and_then(|t| u32::try_from(t).ok())
                    .unwrap_or(self.config.auto_compact_threshold);
                self.run_compaction(events, threshold).await?;
            }
            MiddlewareAction::InjectMessage => {
                if let Some(message) = result.message {
                    self.history.apply_injection(&message);
                }
            }
        }
        Ok(None)
    }

    fn request(&self, messages: Vec<Message>) -> CompletionRequest {
        CompletionRequest::new(&self.model.name, messages)
            .with_temperature(self.model.temperature)
            .with_tools(self.registry.definitions())
            .with_header("x-session-id", self.session_id.to_string())
    }

    async fn whole_response(
        &self,
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<AssembledResponse> {
        let request = self.request(self.history.messages().to_vec());
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            chunk = self.backend.complete(request) => Some(chunk),
        };
        let Some(chunk) = chunk else {
            return Err(user_cancelled(events, CancelReason::UserDuringStream));
        };

        let response = AssembledResponse::from_chunk(chunk?);
        if let Some(content) = response.message.content.clone() {
            emit(events, AgentEvent::Assistant { content });
        }
        Ok(response)
    }

    async fn stream_response(
        &self,
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<AssembledResponse> {
        let request = self.request(self.history.messages().to_vec());
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            stream = self.backend.complete_streaming(request) => Some(stream),
        };
        let Some(stream) = opened else {
            return Err(user_cancelled(events, CancelReason::UserDuringStream));
        };
        let mut stream = stream?;

        let mut assembler = StreamAssembler::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    drop(stream);
                    return Err(user_cancelled(events, CancelReason::UserDuringStream));
                }
                next = stream.recv() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            assembler.push(&chunk)?;
            if let Some(content) = chunk.message.content.filter(|c| !c.is_empty()) {
                emit(events, AgentEvent::Assistant { content });
            }
        }

        debug!(chunks = assembler.chunk_count(), "Stream finished");
        Ok(assembler.finish())
    }

    /// Summarize the conversation and replace the history with the summary.
    pub async fn compact(&mut self, events: &mpsc::Sender<AgentEvent>) -> Result<()> {
        let threshold = self.config.auto_compact_threshold;
        self.run_compaction(events, threshold).await
    }

    /// Any failure before the new history is in place leaves the old one
    /// untouched.
    async fn run_compaction(&mut self, events: &mpsc::Sender<AgentEvent>, threshold: u32) -> Result<()> {
        let old_tokens = self.stats.context_tokens;
        info!(context_tokens = old_tokens, threshold, "Compacting conversation");
        emit(
            events,
            AgentEvent::CompactStart {
                current_context_tokens: old_tokens,
                threshold,
            },
        );

        let last_request = self.history.last_user_text().unwrap_or_default().to_string();
        let mut messages = self.history.messages().to_vec();
        messages.push(Message::user(COMPACT_PROMPT));
        let request = CompletionRequest::new(&self.model.name, messages).with_temperature(self.model.temperature);

        let chunk = self.backend.complete(request).await?;
        if let Some(usage) = chunk.usage {
            self.stats.session_prompt_tokens += u64::from(usage.prompt_tokens);
            self.stats.session_completion_tokens += u64::from(usage.completion_tokens);
        }
        let summary = chunk.message.text().trim().to_string();
        if summary.is_empty() {
            return Err(Error::Protocol("compaction summary was empty".into()));
        }

        let system = self
            .history
            .system_message()
            .cloned()
            .unwrap_or_else(|| Message::system(""));
        let compacted = vec![
            system,
            Message::user(format!("{summary}\n\nLast request from user was: {last_request}")),
        ];
        let new_tokens = self.backend.count_tokens(self.request(compacted.clone())).await?;

        self.history.replace(compacted);
        self.stats.context_tokens = new_tokens;
        self.session_id = SessionId::new();
        self.start_time = Utc::now();
        self.middleware.reset(ResetReason::Compact);

        info!(old_tokens, new_tokens, session = %self.session_id.short(), "Conversation compacted");
        emit(
            events,
            AgentEvent::CompactEnd {
                old_context_tokens: old_tokens,
                new_context_tokens: new_tokens,
                summary_length: summary.len(),
            },
        );
        self.persist().await;
        Ok(())
    }

    /// Save the current session, then start a new one with only the system prompt.
    pub async fn clear_history(&mut self) {
        self.persist().await;
        self.history.reset();
        self.stats.reset();
        self.middleware.reset(ResetReason::Stop);
        self.session_id = SessionId::new();
        self.start_time = Utc::now();
        info!(session = %self.session_id.short(), "History cleared");
    }

    /// Load a saved session by id prefix, or the most recent one when `id` is `None`.
    ///
    /// The loaded messages follow this agent's own system prompt and are
    /// repaired before the next turn.
    pub async fn resume(&mut self, store: &dyn SessionStore, id: Option<&str>) -> Result<SessionMetadata> {
        let handle = match id {
            Some(id) => store.find_by_id(id).await?,
            None => store.find_latest().await?,
        }
        .ok_or_else(|| SessionError::NotFound(id.unwrap_or("latest").to_string()))?;

        let (messages, metadata) = store.load(&handle).await?;
        let repairs = self.history.load_history(messages);

        self.session_id = metadata.session_id.clone();
        self.start_time = metadata.start_time;
        self.stats = AgentStats {
            input_price_per_million: self.model.input_price,
            output_price_per_million: self.model.output_price,
            ..metadata.stats.clone()
        };

        info!(
            session = %self.session_id.short(),
            messages = self.history.len(),
            repairs,
            "Session resumed"
        );
        Ok(metadata)
    }

    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        if self.history.len() <= 1 {
            return;
        }

        let snapshot = SessionSnapshot {
            session_id: self.session_id.clone(),
            start_time: self.start_time,
            messages: self.history.messages().to_vec(),
            stats: self.stats.clone(),
            config: self.config.redacted_snapshot(),
            tools: self.registry.names().into_iter().map(str::to_string).collect(),
            auto_approve: self.auto_approve,
        };
        if let Err(e) = store.save(&snapshot).await {
            warn!(error = %e, session = %self.session_id.short(), "Failed to persist session");
        }
    }
}

/// Never waits: a full or closed channel drops the event.
pub(crate) fn emit(events: &mpsc::Sender<AgentEvent>, event: AgentEvent) {
    match events.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => debug!(event = event.event_type(), "Event channel full, dropping event"),
        Err(TrySendError::Closed(_)) => debug!("Event receiver dropped"),
    }
}

fn user_cancelled(events: &mpsc::Sender<AgentEvent>, reason: CancelReason) -> Error {
    info!(%reason, "Turn cancelled");
    emit(events, AgentEvent::UserCancelled { reason: reason.to_string() });
    Error::Cancelled(reason)
}
