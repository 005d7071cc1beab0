//! Collaborator contracts.
//!
//! The gateway orchestrates; it does not understand language or author
//! content itself. Everything that does is behind one of these traits so the
//! dispatcher can be wired with LLM-backed implementations ([`llm`]) in
//! production and deterministic fakes in tests.

pub mod llm;

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::agent_core::entity_resolver::ResolvedEntity;
use crate::agent_core::router::{contains_han, RouterResult};
use crate::agent_core::AgentError;
use crate::inference::types::ChatMessage;

// ─── Shared Types ───────────────────────────────────────────────────────────

/// A file the user attached to a turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Extracted text, when the client already has it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Everything a responder gets for one turn.
#[derive(Debug, Clone, Default)]
pub struct ChatPrompt {
    pub message: String,
    pub context: BTreeMap<String, serde_json::Value>,
    /// `zh-CN` or `en`.
    pub language: String,
    pub attachments: Vec<Attachment>,
    /// Trailing conversation window, oldest first.
    pub history: Vec<ChatMessage>,
}

/// `zh-CN` when the message contains Han characters, `en` otherwise.
pub fn detect_language(message: &str) -> &'static str {
    if contains_han(message) {
        "zh-CN"
    } else {
        "en"
    }
}

// ─── Classifier / Responder ─────────────────────────────────────────────────

/// Proposes an intent for a message. Its output is post-processed by the
/// confidence router before anything acts on it.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, message: &str, history: &str) -> Result<RouterResult, AgentError>;
}

/// Plain-text answers for small talk, Q&A, and follow-ups about a page.
#[async_trait]
pub trait ChatResponder: Send + Sync {
    async fn answer(&self, prompt: &ChatPrompt) -> Result<String, AgentError>;

    /// A question about content generated earlier in the conversation.
    async fn followup(&self, prompt: &ChatPrompt) -> Result<String, AgentError>;
}

// ─── Pipeline ───────────────────────────────────────────────────────────────

/// Structured outline of a page, produced before any block is written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagePlan {
    pub title: String,
    pub summary: String,
    pub sections: Vec<serde_json::Value>,
}

/// What the executor knows about the turn it builds for.
#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    pub conversation_id: String,
    pub language: String,
    pub entities: Vec<ResolvedEntity>,
    pub context: BTreeMap<String, serde_json::Value>,
}

/// Progress of one pipeline execution.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Phase {
        phase: String,
        message: Option<String>,
    },
    ToolCall {
        call_id: String,
        tool: String,
        input: serde_json::Value,
    },
    ToolResult {
        call_id: String,
        output: serde_json::Value,
    },
    /// Incremental text of one page block.
    BlockDelta {
        block_id: String,
        delta: String,
    },
    /// The finished page content.
    Complete { content: serde_json::Value },
    Error { message: String },
}

/// Turns a prompt into a [`PagePlan`].
#[async_trait]
pub trait PipelineGenerator: Send + Sync {
    /// Returns the plan and the key of the backend that produced it.
    async fn generate(
        &self,
        prompt: &str,
        language: &str,
        attachments: &[Attachment],
    ) -> Result<(PagePlan, String), AgentError>;
}

/// Executes a plan. Every call starts a fresh, lazily driven run.
pub trait PipelineExecutor: Send + Sync {
    fn execute(&self, plan: &PagePlan, context: &PipelineContext) -> BoxStream<'static, PipelineEvent>;
}

// ─── Content ────────────────────────────────────────────────────────────────

/// Authors and revises the content behind the generation tools.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// `kind` is the artifact type (`quiz`, `lesson_plan`, `analysis`, ...).
    async fn generate(&self, kind: &str, request: &serde_json::Value) -> Result<serde_json::Value, AgentError>;

    async fn refine(
        &self,
        kind: &str,
        current: &serde_json::Value,
        instruction: &str,
        scope: Option<&str>,
    ) -> Result<serde_json::Value, AgentError>;
}
