//! Inference: OpenAI-compatible generation backends.
//!
//! This module handles all communication with model endpoints:
//! - Streaming and non-streaming chat completions
//! - Tool call parsing (native JSON + Pythonic) and malformed-JSON repair
//! - SSE stream parsing
//! - Provider-error classification for the fallback chain
//! - The model registry section of the gateway config
//!
//! The rest of the crate depends on the [`GenerationBackend`] trait only, so
//! swapping providers is a config change, not a code change.

pub mod backend;
pub mod client;
pub mod config;
pub mod errors;
pub mod streaming;
pub mod tool_call_parser;
pub mod types;

// Re-exports for convenience
pub use backend::{ChunkStream, GenerationBackend};
pub use client::InferenceClient;
pub use config::{ModelConfig, ModelsConfig, ToolCallFormat};
pub use errors::InferenceError;
pub use types::{ChatMessage, Role, StreamChunk, ToolCall, ToolDefinition};
