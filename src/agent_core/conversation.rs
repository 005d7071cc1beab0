//! Conversation session state: the turn log and what is derived from it.
//!
//! Responsibilities:
//! - Append turns and merge per-turn context
//! - Bounded history windows (text for the classifier, messages for models)
//! - Detect a pending clarification and rewrite a short reply into a
//!   directive that carries the original request forward
//! - Listing summaries for the session API
//!
//! Persistence lives in [`super::session_store`]; this module is pure.

use std::collections::BTreeMap;

use crate::inference::types::ChatMessage;

use super::text::{preview, truncate_utf8};
use super::types::{ConversationSession, SessionSummary, Turn, TurnRole};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Per-turn cap on the text windowed into classifier prompts.
const WINDOW_TURN_MAX_BYTES: usize = 1_200;

/// Length of the listing preview.
const PREVIEW_CHARS: usize = 60;

/// Context key holding the artifact ids produced in this conversation.
pub const ARTIFACT_IDS_KEY: &str = "artifact_ids";

/// Action tag of an assistant turn that asked the user a question.
pub const CLARIFY_ACTION: &str = "clarify";

// ─── ConversationSession ────────────────────────────────────────────────────

impl ConversationSession {
    pub fn new(id: impl Into<String>) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: id.into(),
            turns: Vec::new(),
            context: BTreeMap::new(),
            last_intent: None,
            last_action: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Append a turn. Assistant turns also update `last_action`.
    pub fn append(&mut self, turn: Turn) {
        if turn.role == TurnRole::Assistant {
            if let Some(action) = &turn.action {
                self.last_action = Some(action.clone());
            }
        }
        self.updated_at = turn.timestamp.clone();
        self.turns.push(turn);
    }

    /// Merge new context keys. Newer values win; `artifact_ids` accumulates.
    pub fn merge_context(&mut self, context: BTreeMap<String, serde_json::Value>) {
        for (key, value) in context {
            if key == ARTIFACT_IDS_KEY {
                let ids = value
                    .as_array()
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                    .unwrap_or_default();
                self.record_artifacts(ids);
            } else {
                self.context.insert(key, value);
            }
        }
    }

    /// Remember artifact ids produced this turn, oldest first, without duplicates.
    pub fn record_artifacts(&mut self, ids: Vec<String>) {
        let mut all = self.last_artifact_ids();
        for id in ids {
            if !all.contains(&id) {
                all.push(id);
            }
        }
        self.context.insert(ARTIFACT_IDS_KEY.into(), serde_json::json!(all));
    }

    /// Every artifact id produced in this conversation, oldest first.
    pub fn last_artifact_ids(&self) -> Vec<String> {
        self.context
            .get(ARTIFACT_IDS_KEY)
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default()
    }

    /// The last `max_turns` turns, oldest first.
    pub fn window(&self, max_turns: usize) -> &[Turn] {
        let start = self.turns.len().saturating_sub(max_turns);
        &self.turns[start..]
    }

    /// The window as `User: …` / `Assistant: …` lines.
    pub fn window_text(&self, max_turns: usize) -> String {
        self.window(max_turns)
            .iter()
            .map(|turn| {
                let label = match turn.role {
                    TurnRole::User => "User",
                    TurnRole::Assistant => "Assistant",
                };
                format!("{label}: {}", truncate_utf8(&turn.content, WINDOW_TURN_MAX_BYTES))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The window as model messages.
    pub fn window_messages(&self, max_turns: usize) -> Vec<ChatMessage> {
        self.window(max_turns)
            .iter()
            .map(|turn| match turn.role {
                TurnRole::User => ChatMessage::user(turn.content.clone()),
                TurnRole::Assistant => ChatMessage::assistant(turn.content.clone()),
            })
            .collect()
    }

    /// `(original request, question)` when the last assistant turn asked a
    /// clarifying question.
    pub fn pending_clarification(&self) -> Option<(String, String)> {
        if self.last_action.as_deref() != Some(CLARIFY_ACTION) {
            return None;
        }
        let question_idx = self
            .turns
            .iter()
            .rposition(|t| t.role == TurnRole::Assistant)?;
        let question = &self.turns[question_idx];
        if question.action.as_deref() != Some(CLARIFY_ACTION) {
            return None;
        }
        let original = self.turns[..question_idx]
            .iter()
            .rev()
            .find(|t| t.role == TurnRole::User)?;
        Some((original.content.clone(), question.content.clone()))
    }

    /// Rewrite a short reply to a pending clarification into a directive that
    /// restates the original request and tells the model to act on it.
    ///
    /// `None` when there is nothing pending, or the reply is empty or longer
    /// than `max_chars` (a long reply is treated as a new request).
    pub fn continuation_directive(&self, reply: &str, max_chars: usize) -> Option<String> {
        let reply = reply.trim();
        if reply.is_empty() || reply.chars().count() > max_chars {
            return None;
        }
        let (original, question) = self.pending_clarification()?;
        Some(format!(
            "Original request: {original}\n\
             Clarifying question: {question}\n\
             User's answer: {reply}\n\n\
             Act now: carry out the original request using the answer above. \
             Produce the requested result; do not merely acknowledge the answer."
        ))
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            turn_count: self.turns.len(),
            last_intent: self.last_intent.clone(),
            last_action: self.last_action.clone(),
            preview: self
                .turns
                .iter()
                .find(|t| t.role == TurnRole::User)
                .map(|t| preview(&t.content, PREVIEW_CHARS)),
            updated_at: self.updated_at.clone(),
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::Role;

    fn clarified_session() -> ConversationSession {
        let mut session = ConversationSession::new("conv-1");
        session.append(Turn::user("Make a fractions quiz"));
        session.append(Turn::assistant("Which grade is this for?", CLARIFY_ACTION));
        session
    }

    #[test]
    fn test_append_tracks_last_action() {
        let session = clarified_session();
        assert_eq!(session.turns.len(), 2);
        assert_eq!(session.last_action.as_deref(), Some(CLARIFY_ACTION));
    }

    #[test]
    fn test_window_bounds() {
        let mut session = ConversationSession::new("c");
        for i in 0..15 {
            session.append(Turn::user(format!("msg {i}")));
        }
        let window = session.window(10);
        assert_eq!(window.len(), 10);
        assert_eq!(window[0].content, "msg 5");
        assert_eq!(session.window(100).len(), 15);
        assert!(session.window(0).is_empty());
    }

    #[test]
    fn test_window_text_labels() {
        let text = clarified_session().window_text(10);
        assert_eq!(
            text,
            "User: Make a fractions quiz\nAssistant: Which grade is this for?"
        );
    }

    #[test]
    fn test_window_messages_roles() {
        let msgs = clarified_session().window_messages(10);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[1].role, Role::Assistant);
    }

    #[test]
    fn test_continuation_carries_original_request() {
        let session = clarified_session();
        let directive = session.continuation_directive("Grade 5", 200).unwrap();
        assert!(directive.contains("Original request: Make a fractions quiz"));
        assert!(directive.contains("Clarifying question: Which grade is this for?"));
        assert!(directive.contains("User's answer: Grade 5"));
        assert!(directive.contains("Act now"));
    }

    #[test]
    fn test_continuation_boundaries() {
        let session = clarified_session();
        assert!(session.continuation_directive("", 200).is_none());
        assert!(session.continuation_directive("   ", 200).is_none());
        let long = "x".repeat(201);
        assert!(session.continuation_directive(&long, 200).is_none());
        let exact = "五".repeat(200);
        assert!(session.continuation_directive(&exact, 200).is_some());
    }

    #[test]
    fn test_no_continuation_after_chat() {
        let mut session = clarified_session();
        session.append(Turn::user("Grade 5"));
        session.append(Turn::assistant("Here is your quiz.", "build"));
        assert!(session.pending_clarification().is_none());
        assert!(session.continuation_directive("ok", 200).is_none());
    }

    #[test]
    fn test_merge_context_newest_wins_and_artifacts_accumulate() {
        let mut session = ConversationSession::new("c");
        session.merge_context(BTreeMap::from([
            ("grade".to_string(), serde_json::json!("4")),
            (ARTIFACT_IDS_KEY.to_string(), serde_json::json!(["a1"])),
        ]));
        session.merge_context(BTreeMap::from([
            ("grade".to_string(), serde_json::json!("5")),
            (ARTIFACT_IDS_KEY.to_string(), serde_json::json!(["a2", "a1"])),
        ]));
        assert_eq!(session.context["grade"], "5");
        assert_eq!(session.last_artifact_ids(), vec!["a1", "a2"]);
    }

    #[test]
    fn test_summary_preview_and_counts() {
        let summary = clarified_session().summary();
        assert_eq!(summary.id, "conv-1");
        assert_eq!(summary.turn_count, 2);
        assert_eq!(summary.preview.as_deref(), Some("Make a fractions quiz"));
        assert_eq!(summary.last_action.as_deref(), Some(CLARIFY_ACTION));
    }
}
