//! Integration tests for the tiller turn loop.
//!
//! These drive a full [`Agent`] against a scripted backend and real or fake
//! tools, checking the history, counters, events, and persistence that come
//! out the other end.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tiller_agent::{Agent, AgentEvent, COMPACT_PROMPT, MessageObserver, TurnOutcome};
use tiller_config::AppConfig;
use tiller_core::agent::AgentMode;
use tiller_core::approval::{ApprovalResponse, Approver};
use tiller_core::backend::{Backend, Chunk, ChunkReceiver, CompletionRequest, Usage};
use tiller_core::error::{BackendError, BackendErrorKind, CancelReason, Error, PayloadSummary, ToolError};
use tiller_core::message::{FunctionCall, Message, Role, ToolCall};
use tiller_core::session::{SessionError, SessionHandle, SessionMetadata, SessionSnapshot, SessionStore};
use tiller_core::tool::{Tool, ToolKind, ToolPermission, ToolRegistry, ToolResult, ToolSettings};
use tiller_session::JsonSessionStore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ── Scripted backend ─────────────────────────────────────────────────────

enum Reply {
    Chunks(Vec<Chunk>),
    Fail(BackendErrorKind),
    /// Streams the chunks, then never finishes
    Hang(Vec<Chunk>),
}

struct ScriptedBackend {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<CompletionRequest>>,
    held: Mutex<Vec<mpsc::Sender<Result<Chunk, BackendError>>>>,
    token_count: u32,
}

impl ScriptedBackend {
    fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
            token_count: 42,
        })
    }

    fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next(&self, request: CompletionRequest) -> Reply {
        self.requests.lock().unwrap().push(request);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .expect("ScriptedBackend exhausted")
    }

    fn error(request: &CompletionRequest, kind: BackendErrorKind) -> BackendError {
        BackendError {
            provider: "scripted".into(),
            endpoint: "memory://scripted".into(),
            model: request.model.clone(),
            payload: PayloadSummary::of(&request.messages),
            kind,
        }
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Chunk, BackendError> {
        let sent = request.clone();
        match self.next(request) {
            Reply::Chunks(mut chunks) => {
                assert_eq!(chunks.len(), 1, "non-streaming replies are a single chunk");
                Ok(chunks.remove(0))
            }
            Reply::Fail(kind) => Err(Self::error(&sent, kind)),
            Reply::Hang(_) => std::future::pending().await,
        }
    }

    async fn complete_streaming(&self, request: CompletionRequest) -> Result<ChunkReceiver, BackendError> {
        let sent = request.clone();
        let (chunks, hang) = match self.next(request) {
            Reply::Chunks(chunks) => (chunks, false),
            Reply::Hang(chunks) => (chunks, true),
            Reply::Fail(kind) => return Err(Self::error(&sent, kind)),
        };
        let (tx, rx) = mpsc::channel(chunks.len() + 1);
        for chunk in chunks {
            tx.send(Ok(chunk)).await.unwrap();
        }
        if hang {
            self.held.lock().unwrap().push(tx);
        }
        Ok(rx)
    }

    async fn count_tokens(&self, _request: CompletionRequest) -> Result<u32, BackendError> {
        Ok(self.token_count)
    }
}

fn usage() -> Option<Usage> {
    Some(Usage {
        prompt_tokens: 120,
        completion_tokens: 30,
    })
}

fn text(content: &str) -> Reply {
    Reply::Chunks(vec![Chunk {
        message: Message::assistant(content),
        usage: usage(),
        finish_reason: Some("stop".into()),
    }])
}

fn calls(calls: Vec<ToolCall>) -> Reply {
    Reply::Chunks(vec![Chunk {
        message: Message::assistant_with_tools(None, calls),
        usage: usage(),
        finish_reason: Some("tool_calls".into()),
    }])
}

fn call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
    ToolCall::new(id, name, args.to_string())
}

fn partial(content: &str) -> Chunk {
    Chunk {
        message: Message::assistant(content),
        usage: None,
        finish_reason: None,
    }
}

fn delta(index: u32, id: Option<&str>, name: Option<&str>, args: &str) -> Chunk {
    Chunk {
        message: Message::assistant_with_tools(
            None,
            vec![ToolCall {
                id: id.map(str::to_string),
                index: Some(index),
                function: FunctionCall {
                    name: name.map(str::to_string),
                    arguments: args.to_string(),
                },
            }],
        ),
        usage: None,
        finish_reason: None,
    }
}

fn last(content: Option<&str>, finish_reason: &str) -> Chunk {
    Chunk {
        message: match content {
            Some(text) => Message::assistant(text),
            None => Message::empty(Role::Assistant),
        },
        usage: usage(),
        finish_reason: Some(finish_reason.into()),
    }
}

// ── Fake tools and collaborators ─────────────────────────────────────────

#[derive(Clone, Copy)]
enum Behavior {
    Echo,
    DenyPermission,
    Sleep,
}

struct FakeTool {
    name: &'static str,
    kind: ToolKind,
    permission: ToolPermission,
    behavior: Behavior,
    runs: Arc<AtomicUsize>,
}

impl FakeTool {
    fn new(name: &'static str, kind: ToolKind, permission: ToolPermission) -> Self {
        Self {
            name,
            kind,
            permission,
            behavior: Behavior::Echo,
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn behaving(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }
}

#[async_trait]
impl Tool for FakeTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Test tool"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    fn kind(&self) -> ToolKind {
        self.kind
    }

    fn default_permission(&self) -> ToolPermission {
        self.permission
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            Behavior::Echo => Ok(ToolResult::ok(format!("{} ran with {arguments}", self.name))),
            Behavior::DenyPermission => Err(ToolError::PermissionDenied {
                tool_name: self.name.into(),
                reason: "path is outside the working directory".into(),
            }),
            Behavior::Sleep => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ToolResult::ok("woke up"))
            }
        }
    }
}

struct ScriptedApprover {
    response: ApprovalResponse,
    asked: AtomicUsize,
}

#[async_trait]
impl Approver for ScriptedApprover {
    async fn ask(&self, _: &str, _: &serde_json::Value, _: &str) -> (ApprovalResponse, Option<String>) {
        self.asked.fetch_add(1, Ordering::SeqCst);
        (self.response, None)
    }
}

#[derive(Default)]
struct MemoryStore {
    saved: Mutex<Vec<SessionSnapshot>>,
}

impl MemoryStore {
    fn saves(&self) -> usize {
        self.saved.lock().unwrap().len()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), SessionError> {
        self.saved.lock().unwrap().push(snapshot.clone());
        Ok(())
    }

    async fn find_latest(&self) -> Result<Option<SessionHandle>, SessionError> {
        Ok(self.saved.lock().unwrap().last().map(|s| SessionHandle {
            session_id: s.session_id.to_string(),
            location: "memory".into(),
        }))
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<SessionHandle>, SessionError> {
        Ok(self
            .saved
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|s| s.session_id.0.starts_with(id))
            .map(|s| SessionHandle {
                session_id: s.session_id.to_string(),
                location: "memory".into(),
            }))
    }

    async fn load(&self, handle: &SessionHandle) -> Result<(Vec<Message>, SessionMetadata), SessionError> {
        let saved = self.saved.lock().unwrap();
        let snapshot = saved
            .iter()
            .rev()
            .find(|s| s.session_id.0 == handle.session_id)
            .ok_or_else(|| SessionError::NotFound(handle.session_id.clone()))?;
        Ok((
            snapshot.messages.clone(),
            SessionMetadata {
                session_id: snapshot.session_id.clone(),
                start_time: snapshot.start_time,
                end_time: snapshot.start_time,
                total_messages: snapshot.messages.len(),
                stats: snapshot.stats.clone(),
                config: snapshot.config.clone(),
                tools: snapshot.tools.clone(),
                auto_approve: snapshot.auto_approve,
            },
        ))
    }
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Message>>,
}

impl MessageObserver for Recorder {
    fn on_message(&self, message: &Message) {
        self.seen.lock().unwrap().push(message.clone());
    }
}

// ── Harness ──────────────────────────────────────────────────────────────

fn config(streaming: bool) -> AppConfig {
    AppConfig {
        enable_streaming: streaming,
        workdir: Some("/tmp/tiller-test".into()),
        ..Default::default()
    }
}

fn echo_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(FakeTool::new("echo", ToolKind::Other, ToolPermission::Always)));
    registry
}

fn agent(config: AppConfig, backend: &Arc<ScriptedBackend>, registry: ToolRegistry) -> Agent {
    Agent::new(config, backend.clone(), Arc::new(registry)).unwrap()
}

async fn say(agent: &mut Agent, text: &str) -> (tiller_core::Result<TurnOutcome>, Vec<AgentEvent>) {
    let (tx, mut rx) = mpsc::channel(512);
    let outcome = agent.converse(text, &tx, &CancellationToken::new()).await;
    drop(tx);
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (outcome, events)
}

fn roles(agent: &Agent) -> Vec<Role> {
    agent.messages().iter().map(|m| m.role).collect()
}

fn tool_replies(agent: &Agent) -> Vec<String> {
    agent
        .messages()
        .iter()
        .filter(|m| m.role == Role::Tool)
        .map(|m| m.text().to_string())
        .collect()
}

fn event_types(events: &[AgentEvent]) -> Vec<&'static str> {
    events.iter().map(AgentEvent::event_type).collect()
}

// ── Basic turns ──────────────────────────────────────────────────────────

#[tokio::test]
async fn text_reply_completes_in_one_turn() {
    let backend = ScriptedBackend::new(vec![text("Hello! How can I help?")]);
    let mut agent = agent(config(false), &backend, echo_registry());

    let (outcome, events) = say(&mut agent, "hi").await;

    assert_eq!(
        outcome.unwrap(),
        TurnOutcome::Completed {
            response: "Hello! How can I help?".into()
        }
    );
    assert_eq!(roles(&agent), [Role::System, Role::User, Role::Assistant]);
    assert_eq!(agent.stats().turns, 1);
    assert_eq!(agent.stats().steps, 1);
    assert_eq!(agent.stats().context_tokens, 150);
    assert_eq!(event_types(&events), ["assistant"]);

    let request = &backend.requests()[0];
    assert_eq!(request.model, "devstral-medium-latest");
    assert_eq!(request.tools.len(), 1);
    assert_eq!(request.messages[0].role, Role::System);
}

#[tokio::test]
async fn tool_call_runs_then_model_answers() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "remember the milk").unwrap();
    let config = AppConfig {
        enable_streaming: false,
        workdir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let registry = tiller_tools::default_registry(&config);

    let backend = ScriptedBackend::new(vec![
        calls(vec![call("c1", "read_file", serde_json::json!({"path": "notes.txt"}))]),
        text("The note says to remember the milk."),
    ]);
    let mut agent = agent(config, &backend, registry);

    let (outcome, events) = say(&mut agent, "what does notes.txt say?").await;

    assert!(matches!(outcome.unwrap(), TurnOutcome::Completed { .. }));
    assert_eq!(
        roles(&agent),
        [Role::System, Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
    assert_eq!(tool_replies(&agent), ["remember the milk"]);
    assert_eq!(agent.messages()[3].tool_call_id.as_deref(), Some("c1"));
    assert_eq!(agent.stats().tool_calls_agreed, 1);
    assert_eq!(agent.stats().tool_calls_succeeded, 1);
    assert_eq!(agent.stats().turns, 2);
    assert_eq!(event_types(&events), ["tool_call", "tool_result", "assistant"]);

    // The second request carries the tool reply back to the model
    let second = &backend.requests()[1];
    assert_eq!(second.messages.last().unwrap().role, Role::Tool);
}

#[tokio::test]
async fn empty_reply_after_tool_results_ends_the_turn() {
    let backend = ScriptedBackend::new(vec![
        calls(vec![call("c1", "echo", serde_json::json!({}))]),
        Reply::Chunks(vec![last(None, "stop")]),
    ]);
    let mut agent = agent(config(false), &backend, echo_registry());

    let (outcome, _) = say(&mut agent, "go").await;

    assert_eq!(outcome.unwrap(), TurnOutcome::Completed { response: String::new() });
    assert_eq!(backend.requests().len(), 2);
    assert_eq!(
        roles(&agent),
        [Role::System, Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
    assert!(agent.messages()[4].content.is_none());
}

#[tokio::test]
async fn full_event_channel_does_not_block_the_turn() {
    let backend = ScriptedBackend::new(vec![Reply::Chunks(vec![
        partial("one "),
        partial("two "),
        partial("three "),
        last(Some("four"), "stop"),
    ])]);
    let mut agent = agent(config(true), &backend, echo_registry());
    let (tx, _rx) = mpsc::channel(1);

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        agent.converse("count", &tx, &CancellationToken::new()),
    )
    .await
    .expect("turn blocked on a full event channel");

    assert_eq!(
        outcome.unwrap(),
        TurnOutcome::Completed {
            response: "one two three four".into()
        }
    );
}

#[tokio::test]
async fn missing_call_ids_are_filled_before_history() {
    let mut anonymous = call("", "echo", serde_json::json!({}));
    anonymous.id = None;
    let backend = ScriptedBackend::new(vec![calls(vec![anonymous]), text("done")]);
    let mut agent = agent(config(false), &backend, echo_registry());

    say(&mut agent, "go").await.0.unwrap();

    let assistant = &agent.messages()[2];
    let id = assistant.tool_calls[0].id.clone().unwrap();
    assert!(id.starts_with("call_"));
    assert_eq!(agent.messages()[3].tool_call_id.as_deref(), Some(id.as_str()));
}

#[tokio::test]
async fn observer_sees_each_message_once() {
    let recorder = Arc::new(Recorder::default());
    let backend = ScriptedBackend::new(vec![calls(vec![call("c1", "echo", serde_json::json!({}))]), text("done")]);
    let mut agent = agent(config(false), &backend, echo_registry()).with_observer(recorder.clone());

    say(&mut agent, "go").await.0.unwrap();

    let seen: Vec<Role> = recorder.seen.lock().unwrap().iter().map(|m| m.role).collect();
    assert_eq!(seen, [Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
}

// ── Middleware ───────────────────────────────────────────────────────────

#[tokio::test]
async fn turn_limit_stops_before_second_backend_call() {
    let backend = ScriptedBackend::new(vec![calls(vec![call("c1", "echo", serde_json::json!({}))])]);
    let config = AppConfig {
        max_turns: Some(1),
        ..config(false)
    };
    let mut agent = agent(config, &backend, echo_registry());

    let (outcome, events) = say(&mut agent, "loop forever").await;

    match outcome.unwrap() {
        TurnOutcome::Stopped { reason } => assert!(reason.contains("Turn limit of 1 reached")),
        other => panic!("expected a stop, got {other:?}"),
    }
    assert_eq!(backend.requests().len(), 1);
    assert_eq!(event_types(&events).last(), Some(&"stopped"));

    let last = agent.messages().last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert!(last.text().contains("<stop_event>Turn limit of 1 reached</stop_event>"));
}

#[tokio::test]
async fn auto_compaction_runs_before_the_turn() {
    let backend = ScriptedBackend::new(vec![
        text("first answer"),
        text("Summary: the user asked one question."),
        text("second answer"),
    ]);
    let config = AppConfig {
        auto_compact_threshold: 100,
        ..config(false)
    };
    let mut agent = agent(config, &backend, echo_registry());

    say(&mut agent, "first").await.0.unwrap();
    assert_eq!(agent.stats().context_tokens, 150);
    let first_session = agent.session_id().clone();

    let (outcome, events) = say(&mut agent, "second").await;
    outcome.unwrap();

    assert_eq!(roles(&agent), [Role::System, Role::User, Role::Assistant]);
    assert_eq!(
        agent.messages()[1].text(),
        "Summary: the user asked one question.\n\nLast request from user was: second"
    );
    assert_ne!(agent.session_id(), &first_session);
    assert!(events.contains(&AgentEvent::CompactStart {
        current_context_tokens: 150,
        threshold: 100,
    }));
    assert!(events.contains(&AgentEvent::CompactEnd {
        old_context_tokens: 150,
        new_context_tokens: 42,
        summary_length: "Summary: the user asked one question.".len(),
    }));
}

// ── Compaction ───────────────────────────────────────────────────────────

#[tokio::test]
async fn manual_compaction_replaces_history() {
    let backend = ScriptedBackend::new(vec![
        text("first answer"),
        text("second answer"),
        text("The user asked two questions."),
    ]);
    let mut agent = agent(config(false), &backend, echo_registry());
    say(&mut agent, "first").await.0.unwrap();
    say(&mut agent, "second").await.0.unwrap();
    assert_eq!(agent.messages().len(), 5);
    let system = agent.messages()[0].clone();

    let (tx, _rx) = mpsc::channel(16);
    agent.compact(&tx).await.unwrap();

    assert_eq!(agent.messages().len(), 2);
    assert_eq!(agent.messages()[0], system);
    assert_eq!(agent.messages()[1].role, Role::User);
    assert_eq!(
        agent.messages()[1].text(),
        "The user asked two questions.\n\nLast request from user was: second"
    );
    assert_eq!(agent.stats().context_tokens, 42);

    let summary_request = backend.requests().pop().unwrap();
    assert!(summary_request.tools.is_empty());
    assert_eq!(summary_request.messages.last().unwrap().text(), COMPACT_PROMPT);
}

#[tokio::test]
async fn failed_compaction_keeps_history() {
    let backend = ScriptedBackend::new(vec![
        text("first answer"),
        text("second answer"),
        Reply::Fail(BackendErrorKind::Network("connection reset".into())),
    ]);
    let mut agent = agent(config(false), &backend, echo_registry());
    say(&mut agent, "first").await.0.unwrap();
    say(&mut agent, "second").await.0.unwrap();
    let before = agent.messages().to_vec();
    let session = agent.session_id().clone();

    let (tx, _rx) = mpsc::channel(16);
    let err = agent.compact(&tx).await.unwrap_err();

    assert!(matches!(err, Error::Backend(_)));
    assert_eq!(agent.messages(), before.as_slice());
    assert_eq!(agent.messages().len(), 5);
    assert_eq!(agent.session_id(), &session);
}

// ── Tool decisions ───────────────────────────────────────────────────────

#[tokio::test]
async fn denylisted_delete_is_skipped_with_pattern() {
    let delete = FakeTool::new("delete_file", ToolKind::Edit, ToolPermission::Always);
    let runs = delete.runs.clone();
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(delete));
    registry.set_settings(
        "delete_file",
        ToolSettings {
            permission: None,
            allowlist: vec![],
            denylist: vec!["*.env".into()],
            ..ToolSettings::default()
        },
    );

    let backend = ScriptedBackend::new(vec![
        calls(vec![call("c1", "delete_file", serde_json::json!({"path": "secrets.env"}))]),
        text("I will leave it alone."),
    ]);
    let mut agent = agent(config(false), &backend, registry);

    let (_, events) = say(&mut agent, "delete secrets.env").await;

    let reply = &tool_replies(&agent)[0];
    assert!(reply.contains("denylist"));
    assert!(reply.contains("*.env"));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(agent.stats().tool_calls_rejected, 1);
    assert!(events.iter().any(|e| matches!(e, AgentEvent::ToolResult { skipped: true, .. })));
}

#[tokio::test]
async fn plan_mode_blocks_after_always_approval() {
    let write = FakeTool::new("write_file", ToolKind::Edit, ToolPermission::Ask);
    let runs = write.runs.clone();
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(write));
    let approver = Arc::new(ScriptedApprover {
        response: ApprovalResponse::Always,
        asked: AtomicUsize::new(0),
    });

    let backend = ScriptedBackend::new(vec![
        calls(vec![call("c1", "write_file", serde_json::json!({"path": "a.txt"}))]),
        text("written"),
        calls(vec![call("c2", "write_file", serde_json::json!({"path": "b.txt"}))]),
        text("blocked, here is my plan"),
    ]);
    let mut agent = agent(config(false), &backend, registry).with_approver(approver.clone());

    say(&mut agent, "write a.txt").await.0.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(agent.auto_approve());

    agent.set_mode(AgentMode::Plan);
    say(&mut agent, "now write b.txt").await.0.unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(approver.asked.load(Ordering::SeqCst), 1);
    let replies = tool_replies(&agent);
    assert!(replies[1].contains("blocked in plan mode"));
    assert!(replies[1].contains("Do not retry"));
}

#[tokio::test]
async fn permission_errors_count_as_rejections() {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(
        FakeTool::new("guarded", ToolKind::Other, ToolPermission::Always).behaving(Behavior::DenyPermission),
    ));
    let backend = ScriptedBackend::new(vec![
        calls(vec![call("c1", "guarded", serde_json::json!({}))]),
        text("ok"),
    ]);
    let mut agent = agent(config(false), &backend, registry);

    say(&mut agent, "try it").await.0.unwrap();

    let stats = agent.stats();
    assert_eq!(stats.tool_calls_agreed, 0);
    assert_eq!(stats.tool_calls_rejected, 1);
    assert_eq!(stats.tool_calls_failed, 0);
    assert!(tool_replies(&agent)[0].starts_with("<tool_error>guarded failed:"));
}

// ── Streaming ────────────────────────────────────────────────────────────

#[tokio::test]
async fn streamed_and_whole_responses_build_the_same_history() {
    let whole = ScriptedBackend::new(vec![
        Reply::Chunks(vec![Chunk {
            message: Message::assistant_with_tools(
                Some("Checking.".into()),
                vec![call("c1", "echo", serde_json::json!({"text": "hi"}))],
            ),
            usage: usage(),
            finish_reason: Some("tool_calls".into()),
        }]),
        text("Done."),
    ]);
    let streamed = ScriptedBackend::new(vec![
        Reply::Chunks(vec![
            partial("Check"),
            partial("ing."),
            delta(0, Some("c1"), Some("echo"), "{\"te"),
            delta(0, None, None, "xt\":"),
            delta(0, None, None, "\"hi\"}"),
            last(None, "tool_calls"),
        ]),
        Reply::Chunks(vec![partial("Do"), last(Some("ne."), "stop")]),
    ]);

    let mut a = agent(config(false), &whole, echo_registry());
    let mut b = agent(config(true), &streamed, echo_registry());
    say(&mut a, "echo hi").await.0.unwrap();
    let (outcome, events) = say(&mut b, "echo hi").await;

    assert_eq!(a.messages(), b.messages());
    assert_eq!(outcome.unwrap(), TurnOutcome::Completed { response: "Done.".into() });
    let streamed_text: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            AgentEvent::Assistant { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed_text, ["Check", "ing.", "Do", "ne."]);
}

#[tokio::test]
async fn missing_usage_is_a_protocol_error() {
    let backend = ScriptedBackend::new(vec![Reply::Chunks(vec![Chunk {
        message: Message::assistant("no accounting"),
        usage: None,
        finish_reason: Some("stop".into()),
    }])]);
    let store = Arc::new(MemoryStore::default());
    let mut agent = agent(config(false), &backend, echo_registry()).with_session_store(store.clone());

    let (outcome, events) = say(&mut agent, "hi").await;

    assert!(outcome.unwrap_err().is_protocol());
    assert_eq!(event_types(&events).last(), Some(&"error"));
    assert_eq!(store.saves(), 1);
}

#[tokio::test]
async fn null_stream_index_is_a_protocol_error() {
    let mut bad = delta(0, Some("c1"), Some("echo"), "{}");
    bad.message.tool_calls[0].index = None;
    let backend = ScriptedBackend::new(vec![Reply::Chunks(vec![bad, last(None, "tool_calls")])]);
    let mut agent = agent(config(true), &backend, echo_registry());

    let (outcome, _) = say(&mut agent, "hi").await;
    assert!(outcome.unwrap_err().is_protocol());
}

// ── Cancellation ─────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_during_stream_stops_consumption() {
    let backend = ScriptedBackend::new(vec![Reply::Hang(vec![partial("Thinking")])]);
    let store = Arc::new(MemoryStore::default());
    let mut agent = agent(config(true), &backend, echo_registry()).with_session_store(store.clone());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let (tx, mut rx) = mpsc::channel(64);
    let err = agent.converse("think hard", &tx, &cancel).await.unwrap_err();
    drop(tx);

    assert!(matches!(err, Error::Cancelled(CancelReason::UserDuringStream)));
    assert_eq!(roles(&agent), [Role::System, Role::User]);
    assert_eq!(store.saves(), 1);

    let mut kinds = Vec::new();
    while let Some(event) = rx.recv().await {
        kinds.push(event.event_type());
    }
    assert_eq!(kinds, ["assistant", "user_cancelled"]);
}

#[tokio::test]
async fn cancel_during_tool_leaves_history_well_formed() {
    let mut registry = echo_registry();
    registry.register(Box::new(
        FakeTool::new("slow", ToolKind::Other, ToolPermission::Always).behaving(Behavior::Sleep),
    ));
    let backend = ScriptedBackend::new(vec![
        calls(vec![
            call("c1", "slow", serde_json::json!({})),
            call("c2", "echo", serde_json::json!({})),
        ]),
        text("Starting over."),
    ]);
    let mut agent = agent(config(false), &backend, registry);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let (tx, _rx) = mpsc::channel(64);
    let err = agent.converse("run both", &tx, &cancel).await.unwrap_err();

    assert!(matches!(err, Error::Cancelled(CancelReason::UserDuringTool)));
    let replies = tool_replies(&agent);
    assert_eq!(replies.len(), 2);
    assert!(replies.iter().all(|r| r.starts_with("<user_cancellation>")));

    // The next message picks up from a valid history
    let (outcome, _) = say(&mut agent, "never mind").await;
    outcome.unwrap();
    assert_eq!(
        roles(&agent),
        [
            Role::System,
            Role::User,
            Role::Assistant,
            Role::Tool,
            Role::Tool,
            Role::User,
            Role::Assistant
        ]
    );
}

// ── Session lifecycle ────────────────────────────────────────────────────

#[tokio::test]
async fn resume_restores_a_saved_session() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(JsonSessionStore::new(dir.path(), "session"));
    let backend = ScriptedBackend::new(vec![calls(vec![call("c1", "echo", serde_json::json!({}))]), text("all done")]);

    let mut first = agent(config(false), &backend, echo_registry()).with_session_store(store.clone());
    say(&mut first, "do the thing").await.0?;

    let mut second = agent(config(false), &ScriptedBackend::new(vec![]), echo_registry());
    let metadata = second.resume(store.as_ref(), None).await?;

    assert_eq!(&metadata.session_id, first.session_id());
    assert_eq!(second.messages(), first.messages());
    assert_eq!(second.stats().turns, 2);

    let prefix = &first.session_id().0[..8];
    let mut third = agent(config(false), &ScriptedBackend::new(vec![]), echo_registry());
    third.resume(store.as_ref(), Some(prefix)).await?;
    assert_eq!(third.messages().len(), first.messages().len());
    Ok(())
}

#[tokio::test]
async fn resume_unknown_session_fails() {
    let store = MemoryStore::default();
    let mut agent = agent(config(false), &ScriptedBackend::new(vec![]), echo_registry());
    let err = agent.resume(&store, Some("deadbeef")).await.unwrap_err();
    assert!(matches!(err, Error::Session(SessionError::NotFound(_))));
}

#[tokio::test]
async fn clear_history_starts_a_new_session() {
    let backend = ScriptedBackend::new(vec![text("hi")]);
    let store = Arc::new(MemoryStore::default());
    let mut agent = agent(config(false), &backend, echo_registry()).with_session_store(store.clone());
    say(&mut agent, "hello").await.0.unwrap();
    let old = agent.session_id().clone();
    let saves = store.saves();

    agent.clear_history().await;

    assert_eq!(roles(&agent), [Role::System]);
    assert_eq!(agent.stats().turns, 0);
    assert!(agent.stats().input_price_per_million > 0.0);
    assert_ne!(agent.session_id(), &old);
    assert_eq!(store.saves(), saves + 1);
}
