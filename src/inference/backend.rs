//! The seam between the orchestration layer and whatever generates text.
//!
//! The orchestrator only ever talks to a [`GenerationBackend`]; the HTTP
//! [`InferenceClient`](super::InferenceClient) is the production
//! implementation, tests use scripted backends.

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::errors::InferenceError;
use super::types::{ChatMessage, StreamChunk, ToolDefinition};

/// A boxed stream of chunks from one generation call.
pub type ChunkStream = BoxStream<'static, Result<StreamChunk, InferenceError>>;

/// A source of chat completions addressable by model key.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Start a streaming completion on `model_key`.
    ///
    /// Errors returned here happened before the first chunk; errors inside the
    /// stream happened mid-generation. Both are classified the same way.
    async fn stream_chat(
        &self,
        model_key: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<ChunkStream, InferenceError>;

    /// Run a non-streaming completion without tools on `model_key`.
    async fn complete(
        &self,
        model_key: &str,
        messages: &[ChatMessage],
    ) -> Result<StreamChunk, InferenceError>;

    /// Ordered model keys to try, primary first.
    fn model_chain(&self) -> Vec<String>;

    /// Non-streaming completion that walks the chain on provider errors.
    ///
    /// Returns the key of the model that answered alongside its response.
    async fn complete_with_fallback(
        &self,
        messages: &[ChatMessage],
    ) -> Result<(String, StreamChunk), InferenceError> {
        let chain = self.model_chain();
        let mut attempted = Vec::with_capacity(chain.len());

        for key in &chain {
            match self.complete(key, messages).await {
                Ok(chunk) => return Ok((key.clone(), chunk)),
                Err(e) if e.is_provider_error() => {
                    tracing::warn!(model = %key, error = %e, "model unavailable, trying next in chain");
                    attempted.push(key.clone());
                }
                Err(e) => return Err(e),
            }
        }

        Err(InferenceError::AllModelsUnavailable { attempted })
    }
}
