//! Folding streamed chunks back into one assistant message.

use std::collections::BTreeMap;

use tiller_core::backend::{Chunk, Usage};
use tiller_core::error::{Error, Result};
use tiller_core::message::{Message, ToolCall};

/// A complete model response, however it arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledResponse {
    pub message: Message,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
}

impl AssembledResponse {
    /// Normalize a whole (non-streamed) chunk the same way a stream is.
    pub fn from_chunk(chunk: Chunk) -> Self {
        let mut message = chunk.message;
        for call in &mut message.tool_calls {
            call.index = None;
        }
        if message.content.as_deref().is_some_and(str::is_empty) {
            message.content = None;
        }
        Self {
            message,
            usage: chunk.usage,
            finish_reason: chunk.finish_reason,
        }
    }
}

/// Accumulates chunk deltas.
///
/// Content is concatenated in arrival order. Tool-call deltas are keyed by
/// `index`: the first delta seeds the call, later ones only append to
/// `arguments`. `id` and `name` are taken from the first delta that carries
/// them and never overwritten. The last non-null `finish_reason` and `usage`
/// win.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    content: String,
    tool_calls: BTreeMap<u32, ToolCall>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    chunks: usize,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &Chunk) -> Result<()> {
        self.chunks += 1;

        if let Some(text) = &chunk.message.content {
            self.content.push_str(text);
        }

        for delta in &chunk.message.tool_calls {
            let Some(index) = delta.index else {
                return Err(Error::Protocol(format!(
                    "tool call delta without an index in chunk {}",
                    self.chunks
                )));
            };
            let call = self.tool_calls.entry(index).or_insert_with(|| ToolCall {
                id: None,
                index: Some(index),
                function: Default::default(),
            });
            if call.id.is_none() {
                call.id = delta.id.clone();
            }
            if call.function.name.is_none() {
                call.function.name = delta.function.name.clone();
            }
            call.function.arguments.push_str(&delta.function.arguments);
        }

        if chunk.finish_reason.is_some() {
            self.finish_reason = chunk.finish_reason.clone();
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }
        Ok(())
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks
    }

    pub fn finish(self) -> AssembledResponse {
        let tool_calls = self
            .tool_calls
            .into_values()
            .map(|mut call| {
                call.index = None;
                call
            })
            .collect();
        let content = (!self.content.is_empty()).then_some(self.content);
        AssembledResponse {
            message: Message::assistant_with_tools(content, tool_calls),
            usage: self.usage,
            finish_reason: self.finish_reason,
        }
    }
}
