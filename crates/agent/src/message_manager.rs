//! Conversation history and its invariants.
//!
//! [`MessageManager`] is the only owner of the message list. Index 0 is
//! always the system prompt. After [`MessageManager::repair`]:
//! - every assistant tool call has exactly one reply, in call order
//! - no tool reply exists without a call
//! - no two user messages are adjacent
//! - the history does not end on a tool reply

use std::sync::Arc;

use tiller_core::message::{Message, Role};
use tracing::debug;

use crate::tags::{ACKNOWLEDGEMENT, NO_RESPONSE};

/// Receives every appended message exactly once, in order.
pub trait MessageObserver: Send + Sync {
    fn on_message(&self, message: &Message);
}

pub struct MessageManager {
    messages: Vec<Message>,
    observer: Option<Arc<dyn MessageObserver>>,
    /// Messages before this index have been handed to the observer
    observed: usize,
}

impl MessageManager {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system_prompt)],
            observer: None,
            observed: 1,
        }
    }

    /// Only messages appended from now on are reported.
    pub fn set_observer(&mut self, observer: Arc<dyn MessageObserver>) {
        self.observer = Some(observer);
        self.observed = self.messages.len();
    }

    /// Start over with a fresh system prompt.
    pub fn initialize(&mut self, system_prompt: impl Into<String>) {
        self.messages = vec![Message::system(system_prompt)];
        self.observed = self.messages.len();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn system_message(&self) -> Option<&Message> {
        self.messages.first().filter(|m| m.role == Role::System)
    }

    pub fn last_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(Message::text)
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
        self.flush_observer();
    }

    fn flush_observer(&mut self) {
        if let Some(observer) = &self.observer {
            for message in &self.messages[self.observed..] {
                observer.on_message(message);
            }
        }
        self.observed = self.messages.len();
    }

    /// Fold injected text into the history.
    ///
    /// Extends the last assistant message when there is one; otherwise
    /// appends a new assistant message carrying only `text`.
    pub fn apply_injection(&mut self, text: &str) {
        match self.messages.last_mut() {
            Some(last) if last.role == Role::Assistant => match &mut last.content {
                Some(content) if !content.is_empty() => {
                    content.push_str("\n\n");
                    content.push_str(text);
                }
                _ => last.content = Some(text.to_string()),
            },
            _ => self.append(Message::assistant(text)),
        }
    }

    /// Replace everything after the system prompt with `messages`.
    ///
    /// System messages inside `messages` are dropped; the current prompt wins.
    /// Returns the number of repairs the loaded history needed.
    pub fn load_history(&mut self, messages: Vec<Message>) -> usize {
        let system = self.system_message().cloned();
        self.messages = system.into_iter().collect();
        self.messages
            .extend(messages.into_iter().filter(|m| m.role != Role::System));
        self.observed = self.messages.len();
        self.repair()
    }

    /// Swap the whole history, e.g. for a compacted one.
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.observed = self.messages.len();
    }

    /// Keep only the system prompt.
    pub fn reset(&mut self) {
        self.messages.truncate(1);
        self.observed = self.messages.len();
    }

    /// Re-establish the history invariants. Returns how many changes were made;
    /// a second call right after always returns 0.
    ///
    /// Synthetic messages are not reported to the observer.
    pub fn repair(&mut self) -> usize {
        let original = std::mem::take(&mut self.messages);
        let mut repaired: Vec<Message> = Vec::with_capacity(original.len() + 2);
        let mut changes = 0;
        let mut iter = original.into_iter().peekable();

        while let Some(message) = iter.next() {
            match message.role {
                Role::Tool => {
                    debug!(tool_call_id = ?message.tool_call_id, "Dropping orphan tool reply");
                    changes += 1;
                }
                Role::User if repaired.last().is_some_and(|m| m.role == Role::User) => {
                    repaired.push(Message::assistant(ACKNOWLEDGEMENT));
                    repaired.push(message);
                    changes += 1;
                }
                Role::Assistant if message.has_tool_calls() => {
                    let mut replies: Vec<Option<Message>> = Vec::new();
                    while iter.peek().is_some_and(|m| m.role == Role::Tool) {
                        replies.push(iter.next());
                    }
                    let calls = message.tool_calls.clone();
                    repaired.push(message);

                    let mut used = 0;
                    for (position, call) in calls.iter().enumerate() {
                        let id = call.id.clone().unwrap_or_default();
                        let found = replies.iter().position(|r| {
                            r.as_ref()
                                .is_some_and(|m| m.tool_call_id.as_deref().unwrap_or_default() == id)
                        });
                        match found.and_then(|i| replies[i].take().map(|m| (i, m))) {
                            Some((i, reply)) => {
                                if i != position {
                                    changes += 1;
                                }
                                used += 1;
                                repaired.push(reply);
                            }
                            None => {
                                debug!(tool_call_id = %id, "Synthesizing missing tool reply");
                                repaired.push(Message::tool_result(
                                    id,
                                    call.name().map(str::to_string),
                                    NO_RESPONSE,
                                ));
                                changes += 1;
                            }
                        }
                    }
                    changes += replies.len() - used;
                }
                _ => repaired.push(message),
            }
        }

        if repaired.last().is_some_and(|m| m.role == Role::Tool) {
            repaired.push(Message::assistant(ACKNOWLEDGEMENT));
            changes += 1;
        }

        self.messages = repaired;
        self.observed = self.messages.len();
        changes
    }
}
