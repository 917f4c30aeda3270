//! The LLM gateway.
//!
//! Providers are interchangeable behind [`LlmProvider`]; the gateway routes a
//! model id to a provider, retries transient failures with exponential
//! backoff, and falls over to a configured fallback provider before
//! surfacing the error. Adapter errors are converted to the core taxonomy at
//! the boundary, so callers never observe provider-specific failures.

#![deny(unsafe_code)]

pub mod anthropic;
pub mod gateway;
pub mod openai;
pub mod types;

pub use anthropic::AnthropicProvider;
pub use gateway::{GatewayConfig, LlmGateway};
pub use openai::OpenAiProvider;
pub use types::{
    CompletionRequest, CompletionResponse, Message, Role, StopReason, ToolCall, ToolChoice,
    ToolDefinition, Usage,
};

use atelier_types::{CoreResult, Ctx};
use futures::stream::BoxStream;

#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        request: &CompletionRequest,
        ctx: &Ctx,
    ) -> CoreResult<CompletionResponse>;

    /// Optional streaming variant yielding content chunks.
    async fn stream(
        &self,
        _request: &CompletionRequest,
        _ctx: &Ctx,
    ) -> CoreResult<BoxStream<'static, CoreResult<String>>> {
        Err(atelier_types::CoreError::Validation(format!(
            "provider {} does not support streaming",
            self.name()
        )))
    }
}
