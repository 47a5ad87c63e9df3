//! Backend adapters for tiller.
//!
//! All adapters implement the `tiller_core::Backend` trait:
//! - [`GenericBackend`]: OpenAI-style REST body posted to `/chat/completions`, SSE streaming
//! - [`AnthropicBackend`]: wraps the native [`anthropic::MessagesClient`] and normalizes its output
//!
//! [`create_backend`] picks the right one for the active model.

pub mod anthropic;
pub mod classify;
pub mod factory;
pub mod generic;
pub mod retry;
pub mod sse;
#[cfg(test)]
mod test_support;

pub use anthropic::AnthropicBackend;
pub use factory::create_backend;
pub use generic::GenericBackend;
pub use retry::RetryPolicy;
