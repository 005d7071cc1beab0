//! Shared types for the agent core.
//!
//! Conversation turns and sessions, versioned artifacts, tool progress
//! events, and the terminal result of a tool-calling turn.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ─── Conversation ───────────────────────────────────────────────────────────

/// Who spoke a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One message within a conversation. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_count: Option<u32>,
    /// Outcome tag of an assistant turn: `chat`, `clarify`, `build`, ...
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Compact summary of the tools an assistant turn used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_summary: Option<String>,
    /// ISO 8601 timestamp.
    pub timestamp: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            attachment_count: None,
            action: None,
            tool_summary: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn assistant(content: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
            attachment_count: None,
            action: Some(action.into()),
            tool_summary: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_attachments(mut self, count: u32) -> Self {
        self.attachment_count = (count > 0).then_some(count);
        self
    }

    pub fn with_tool_summary(mut self, summary: Option<String>) -> Self {
        self.tool_summary = summary.filter(|s| !s.is_empty());
        self
    }
}

/// The ordered turn log plus accumulated context for one conversation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSession {
    pub id: String,
    #[serde(default)]
    pub turns: Vec<Turn>,
    /// Merged turn over turn; the newest value for a key wins.
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub last_intent: Option<String>,
    #[serde(default)]
    pub last_action: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Listing entry for a stored session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub turn_count: usize,
    pub last_intent: Option<String>,
    pub last_action: Option<String>,
    /// First user message, truncated. Doubles as a title.
    pub preview: Option<String>,
    pub updated_at: String,
}

// ─── Artifacts ──────────────────────────────────────────────────────────────

/// A versioned generated content object (quiz, document, analysis, page).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub artifact_id: String,
    pub artifact_type: String,
    /// `json`, `markdown`, `html`, ...
    pub content_format: String,
    /// Opaque payload owned by whoever generated it.
    pub content: serde_json::Value,
    /// Starts at 1, increments by exactly 1 per patch.
    pub version: u32,
    #[serde(default)]
    pub resources: Vec<String>,
    pub created_at: String,
}

/// Input for creating a new artifact (no id or version yet).
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactDraft {
    pub artifact_type: String,
    pub content_format: String,
    pub content: serde_json::Value,
    pub resources: Vec<String>,
}

/// New content for the next version of an existing artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactPatch {
    pub content: serde_json::Value,
    /// `None` keeps the previous version's resources.
    pub resources: Option<Vec<String>>,
}

// ─── Tool Progress ──────────────────────────────────────────────────────────

/// Lifecycle state of one tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Running,
    Done,
    Error,
}

/// Progress notice emitted by the tool tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEvent {
    pub tool: String,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

// ─── Terminal Result ────────────────────────────────────────────────────────

/// Terminal status of a tool-calling turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    AnswerReady,
    ArtifactReady,
    ClarifyNeeded,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::AnswerReady => "answer_ready",
            ResultStatus::ArtifactReady => "artifact_ready",
            ResultStatus::ClarifyNeeded => "clarify_needed",
        }
    }
}

/// A question back to the user, with optional suggested answers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClarifyPayload {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// The final structured outcome of one tool-calling turn.
///
/// This is also the argument schema of the `submit_result` tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub status: ResultStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub artifact_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarify: Option<ClarifyPayload>,
}

impl FinalResult {
    pub fn answer(message: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::AnswerReady,
            message: message.into(),
            artifact_ids: Vec::new(),
            clarify: None,
        }
    }

    pub fn clarify(question: impl Into<String>, options: Vec<String>) -> Self {
        let question = question.into();
        Self {
            status: ResultStatus::ClarifyNeeded,
            message: question.clone(),
            artifact_ids: Vec::new(),
            clarify: Some(ClarifyPayload { question, options }),
        }
    }

    pub fn artifacts(message: impl Into<String>, artifact_ids: Vec<String>) -> Self {
        Self {
            status: ResultStatus::ArtifactReady,
            message: message.into(),
            artifact_ids,
            clarify: None,
        }
    }

    /// The clarify question, if one is present and non-blank.
    pub fn clarify_question(&self) -> Option<&str> {
        self.clarify
            .as_ref()
            .map(|c| c.question.trim())
            .filter(|q| !q.is_empty())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
