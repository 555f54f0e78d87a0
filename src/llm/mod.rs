//! Language-model responder.
//!
//! The orchestration layer only sees [`LlmResponder`]: a root-first path of
//! messages goes in, one assistant reply plus usage metadata comes out.
//! [`OpenRouterClient`] is the HTTP implementation.

mod client;
mod types;


pub use client::OpenRouterClient;
pub use types::*;

use async_trait::async_trait;

use crate::error::LlmResult;
use crate::tree::Message;

/// Turns a conversation path into a reply.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LlmResponder: Send + Sync {
    /// Produce the next assistant turn for `path` (root first).
    ///
    /// Fails with [`LlmError::Timeout`](crate::error::LlmError::Timeout) or an
    /// upstream error on transport/HTTP failure.
    async fn respond(&self, path: &[Message], options: &CompletionOptions) -> LlmResult<LlmReply>;
}
