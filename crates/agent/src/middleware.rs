//! Per-turn policies.
//!
//! Each [`Middleware`] looks at a read-only [`ConversationContext`] before
//! and after every turn. [`MiddlewarePipeline`] evaluates them in
//! registration order:
//! - the first `Stop` or `Compact` wins and ends evaluation
//! - `InjectMessage` results are joined with blank lines into one result
//! - `InjectMessage` after a turn is rejected as an error

use tiller_config::AppConfig;
use tiller_core::agent::{AgentMode, AgentStats};
use tiller_core::error::{Error, Result};
use tiller_core::message::Message;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareAction {
    Continue,
    Stop,
    Compact,
    InjectMessage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MiddlewareResult {
    pub action: MiddlewareAction,
    pub message: Option<String>,
    pub reason: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Default for MiddlewareResult {
    fn default() -> Self {
        Self {
            action: MiddlewareAction::Continue,
            message: None,
            reason: None,
            metadata: serde_json::Map::new(),
        }
    }
}

impl MiddlewareResult {
    pub fn stop(reason: impl Into<String>) -> Self {
        Self {
            action: MiddlewareAction::Stop,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn compact(metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            action: MiddlewareAction::Compact,
            metadata,
            ..Self::default()
        }
    }

    pub fn inject(message: impl Into<String>) -> Self {
        Self {
            action: MiddlewareAction::InjectMessage,
            message: Some(message.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    Stop,
    Compact,
}

/// What a middleware gets to see.
pub struct ConversationContext<'a> {
    pub messages: &'a [Message],
    pub stats: &'a AgentStats,
    pub config: &'a AppConfig,
    pub mode: AgentMode,
}

pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    fn before_turn(&mut self, context: &ConversationContext<'_>) -> MiddlewareResult;

    fn after_turn(&mut self, _context: &ConversationContext<'_>) -> MiddlewareResult {
        MiddlewareResult::default()
    }

    /// Clear once-only state.
    fn reset(&mut self, _reason: ResetReason) {}
}

#[derive(Clone, Copy)]
enum Phase {
    BeforeTurn,
    AfterTurn,
}

#[derive(Default)]
pub struct MiddlewarePipeline {
    middlewares: Vec<Box<dyn Middleware>>,
}

impl MiddlewarePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in policies enabled by `config`, in evaluation order.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut pipeline = Self::new();
        if let Some(turns) = config.max_turns {
            pipeline.add(TurnLimit::new(turns));
        }
        if let Some(price) = config.max_price {
            pipeline.add(PriceLimit::new(price));
        }
        if config.auto_compact_threshold > 0 {
            pipeline.add(AutoCompact::new(config.auto_compact_threshold));
            if config.context_warnings {
                pipeline.add(ContextWarning::new(0.5, config.auto_compact_threshold));
            }
        }
        pipeline.add(PlanModeReminder::default());
        pipeline
    }

    pub fn add(&mut self, middleware: impl Middleware + 'static) {
        self.middlewares.push(Box::new(middleware));
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    fn evaluate(&mut self, phase: Phase, context: &ConversationContext<'_>) -> MiddlewareResult {
        let mut injected = Vec::new();

        for middleware in &mut self.middlewares {
            let result = match phase {
                Phase::BeforeTurn => middleware.before_turn(context),
                Phase::AfterTurn => middleware.after_turn(context),
            };
            match result.action {
                MiddlewareAction::Stop | MiddlewareAction::Compact => {
                    debug!(middleware = middleware.name(), action = ?result.action, "Middleware ended evaluation");
                    return result;
                }
                MiddlewareAction::InjectMessage => {
                    if let Some(message) = result.message {
                        injected.push(message);
                    }
                }
                MiddlewareAction::Continue => {}
            }
        }

        if injected.is_empty() {
            MiddlewareResult::default()
        } else {
            MiddlewareResult::inject(injected.join("\n\n"))
        }
    }

    pub fn run_before_turn(&mut self, context: &ConversationContext<'_>) -> MiddlewareResult {
        self.evaluate(Phase::BeforeTurn, context)
    }

    pub fn run_after_turn(&mut self, context: &ConversationContext<'_>) -> Result<MiddlewareResult> {
        let result = self.evaluate(Phase::AfterTurn, context);
        if result.action == MiddlewareAction::InjectMessage {
            return Err(Error::Middleware(
                "InjectMessage is not allowed in after_turn: the turn has already closed".into(),
            ));
        }
        Ok(result)
    }

    pub fn reset(&mut self, reason: ResetReason) {
        for middleware in &mut self.middlewares {
            middleware.reset(reason);
        }
    }
}

/// Stops once `max_turns` backend calls have been made.
pub struct TurnLimit {
    max_turns: u32,
}

impl TurnLimit {
    pub fn new(max_turns: u32) -> Self {
        Self { max_turns }
    }
}

impl Middleware for TurnLimit {
    fn name(&self) -> &str {
        "turn_limit"
    }

    fn before_turn(&mut self, context: &ConversationContext<'_>) -> MiddlewareResult {
        if context.stats.turns >= self.max_turns {
            MiddlewareResult::stop(format!("Turn limit of {} reached", self.max_turns))
        } else {
            MiddlewareResult::default()
        }
    }
}

/// Stops once the session has cost more than `max_price` dollars.
pub struct PriceLimit {
    max_price: f64,
}

impl PriceLimit {
    pub fn new(max_price: f64) -> Self {
        Self { max_price }
    }
}

impl Middleware for PriceLimit {
    fn name(&self) -> &str {
        "price_limit"
    }

    fn before_turn(&mut self, context: &ConversationContext<'_>) -> MiddlewareResult {
        let cost = context.stats.session_cost();
        if cost > self.max_price {
            MiddlewareResult::stop(format!(
                "Price limit exceeded: ${cost:.4} > ${:.2}",
                self.max_price
            ))
        } else {
            MiddlewareResult::default()
        }
    }
}

/// Requests compaction when the context reaches `threshold` tokens.
pub struct AutoCompact {
    threshold: u32,
}

impl AutoCompact {
    pub fn new(threshold: u32) -> Self {
        Self { threshold }
    }
}

impl Middleware for AutoCompact {
    fn name(&self) -> &str {
        "auto_compact"
    }

    fn before_turn(&mut self, context: &ConversationContext<'_>) -> MiddlewareResult {
        if context.stats.context_tokens < self.threshold {
            return MiddlewareResult::default();
        }
        let mut metadata = serde_json::Map::new();
        metadata.insert("old_tokens".into(), context.stats.context_tokens.into());
        metadata.insert("threshold".into(), self.threshold.into());
        MiddlewareResult::compact(metadata)
    }
}

/// Warns the model once when the context passes a fraction of the threshold.
pub struct ContextWarning {
    fraction: f64,
    threshold: u32,
    warned: bool,
}

impl ContextWarning {
    pub fn new(fraction: f64, threshold: u32) -> Self {
        Self {
            fraction,
            threshold,
            warned: false,
        }
    }
}

impl Middleware for ContextWarning {
    fn name(&self) -> &str {
        "context_warning"
    }

    fn before_turn(&mut self, context: &ConversationContext<'_>) -> MiddlewareResult {
        if self.warned {
            return MiddlewareResult::default();
        }
        let used = context.stats.context_tokens;
        if f64::from(used) < f64::from(self.threshold) * self.fraction {
            return MiddlewareResult::default();
        }
        self.warned = true;
        let percent = f64::from(used) / f64::from(self.threshold) * 100.0;
        MiddlewareResult::inject(format!(
            "<context_warning>{percent:.0}% of the context budget is used ({used}/{} tokens). \
             Be concise and avoid reading large files unless needed.</context_warning>",
            self.threshold
        ))
    }

    fn reset(&mut self, _reason: ResetReason) {
        self.warned = false;
    }
}

pub const PLAN_MODE_REMINDER: &str = "<plan_mode>Plan mode is active. Only read-only tools \
    may run; every edit, write, or command with side effects is blocked. Investigate, then \
    present a plan and wait for the user to switch modes.</plan_mode>";

/// Reminds the model once each time plan mode is entered.
#[derive(Default)]
pub struct PlanModeReminder {
    reminded: bool,
}

impl Middleware for PlanModeReminder {
    fn name(&self) -> &str {
        "plan_mode"
    }

    fn before_turn(&mut self, context: &ConversationContext<'_>) -> MiddlewareResult {
        if context.mode != AgentMode::Plan {
            self.reminded = false;
            return MiddlewareResult::default();
        }
        if self.reminded {
            return MiddlewareResult::default();
        }
        self.reminded = true;
        MiddlewareResult::inject(PLAN_MODE_REMINDER)
    }

    fn reset(&mut self, _reason: ResetReason) {
        self.reminded = false;
    }
}
