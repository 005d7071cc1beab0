//! LLM-backed collaborators.
//!
//! Thin prompt wrappers over a [`GenerationBackend`]. Each call walks the
//! model chain with [`GenerationBackend::complete_with_fallback`]; the
//! structured ones read the reply with the same lenient JSON parser used for
//! malformed tool calls.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{Attachment, ChatPrompt, ChatResponder, ContentGenerator, IntentClassifier};
use crate::agent_core::router::RouterResult;
use crate::agent_core::text::truncate_utf8;
use crate::agent_core::AgentError;
use crate::inference::tool_call_parser::parse_lenient_json;
use crate::inference::types::ChatMessage;
use crate::inference::GenerationBackend;

/// Per-attachment cap on extracted text inlined into a prompt.
const ATTACHMENT_MAX_BYTES: usize = 4_000;

const CLASSIFIER_SYSTEM: &str = "\
You classify messages sent to a teaching assistant. Reply with one JSON object only:
{\"intent\": string, \"confidence\": number 0-1, \"clarifying_question\": string|null,
 \"refine_scope\": \"block\"|\"section\"|\"page\"|null, \"model_tier\": \"fast\"|\"strong\",
 \"suggested_tools\": [string], \"parameters\": object, \"completeness\": number 0-1,
 \"missing_critical\": [string], \"strategy\": \"direct\"|\"pipeline\"|\"agent\"}
Intents: quiz_generate, content_generate, page_build, data_analyze, content_refine,
chat_smalltalk, chat_qa, page_followup, clarify.
Use strategy \"pipeline\" for whole interactive pages and \"agent\" for anything needing tools.";

const CHAT_SYSTEM: &str = "\
You are a friendly teaching assistant. Answer briefly and accurately. \
Do not claim to have created anything you did not create.";

const FOLLOWUP_SYSTEM: &str = "\
You are a teaching assistant answering a question about content you generated \
earlier in this conversation. Refer to it concretely; do not regenerate it.";

const CONTENT_SYSTEM: &str = "\
You author classroom content. Reply with a single JSON object only, no prose, no code fences.";

fn language_line(language: &str) -> String {
    match language {
        "zh-CN" => "Reply in Simplified Chinese.".to_string(),
        "" | "en" => "Reply in English.".to_string(),
        other => format!("Reply in the language with tag {other}."),
    }
}

fn attachment_block(attachments: &[Attachment]) -> Option<String> {
    let parts: Vec<String> = attachments
        .iter()
        .map(|a| match &a.text {
            Some(text) => format!("[{}]\n{}", a.name, truncate_utf8(text, ATTACHMENT_MAX_BYTES)),
            None => format!("[{}] (no text extracted)", a.name),
        })
        .collect();
    (!parts.is_empty()).then(|| format!("Attachments:\n{}", parts.join("\n\n")))
}

async fn complete_text(
    backend: &dyn GenerationBackend,
    collaborator: &str,
    messages: &[ChatMessage],
) -> Result<(String, String), AgentError> {
    let (model, chunk) = backend
        .complete_with_fallback(messages)
        .await
        .map_err(|e| AgentError::collaborator(collaborator, e))?;
    let text = chunk.token.unwrap_or_default();
    if text.trim().is_empty() {
        return Err(AgentError::collaborator(collaborator, format!("{model} returned an empty reply")));
    }
    Ok((model, text))
}

// ─── Classifier ─────────────────────────────────────────────────────────────

pub struct LlmIntentClassifier {
    backend: Arc<dyn GenerationBackend>,
}

impl LlmIntentClassifier {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl IntentClassifier for LlmIntentClassifier {
    async fn classify(&self, message: &str, history: &str) -> Result<RouterResult, AgentError> {
        let user = if history.is_empty() {
            format!("Message: {message}")
        } else {
            format!("Conversation so far:\n{history}\n\nMessage: {message}")
        };
        let messages = [ChatMessage::system(CLASSIFIER_SYSTEM), ChatMessage::user(user)];
        let (model, text) = complete_text(self.backend.as_ref(), "intent classifier", &messages).await?;

        let value = parse_lenient_json(&text)
            .ok_or_else(|| AgentError::collaborator("intent classifier", "reply is not JSON"))?;
        let result: RouterResult =
            serde_json::from_value(value).map_err(|e| AgentError::collaborator("intent classifier", e))?;
        tracing::debug!(model = %model, intent = %result.intent, confidence = result.confidence, "classified");
        Ok(result)
    }
}

// ─── Responder ──────────────────────────────────────────────────────────────

pub struct LlmChatResponder {
    backend: Arc<dyn GenerationBackend>,
}

impl LlmChatResponder {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self { backend }
    }

    fn messages(system: &str, prompt: &ChatPrompt) -> Vec<ChatMessage> {
        let mut system = format!("{system}\n{}", language_line(&prompt.language));
        if !prompt.context.is_empty() {
            if let Ok(context) = serde_json::to_string(&prompt.context) {
                system.push_str(&format!("\nConversation context: {context}"));
            }
        }

        let mut messages = Vec::with_capacity(prompt.history.len() + 2);
        messages.push(ChatMessage::system(system));
        messages.extend(prompt.history.iter().cloned());
        let user = match attachment_block(&prompt.attachments) {
            Some(block) => format!("{}\n\n{block}", prompt.message),
            None => prompt.message.clone(),
        };
        messages.push(ChatMessage::user(user));
        messages
    }
}

#[async_trait]
impl ChatResponder for LlmChatResponder {
    async fn answer(&self, prompt: &ChatPrompt) -> Result<String, AgentError> {
        let messages = Self::messages(CHAT_SYSTEM, prompt);
        complete_text(self.backend.as_ref(), "chat responder", &messages)
            .await
            .map(|(_, text)| text)
    }

    async fn followup(&self, prompt: &ChatPrompt) -> Result<String, AgentError> {
        let messages = Self::messages(FOLLOWUP_SYSTEM, prompt);
        complete_text(self.backend.as_ref(), "followup responder", &messages)
            .await
            .map(|(_, text)| text)
    }
}

// ─── Content ────────────────────────────────────────────────────────────────

pub struct LlmContentGenerator {
    backend: Arc<dyn GenerationBackend>,
}

impl LlmContentGenerator {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self { backend }
    }

    async fn author(&self, user: String) -> Result<serde_json::Value, AgentError> {
        let messages = [ChatMessage::system(CONTENT_SYSTEM), ChatMessage::user(user)];
        let (model, text) = complete_text(self.backend.as_ref(), "content generator", &messages).await?;
        match parse_lenient_json(&text) {
            Some(value) if value.is_object() => Ok(value),
            _ => {
                tracing::warn!(model = %model, "content reply was not a JSON object, keeping it as text");
                Ok(json!({ "format": "markdown", "text": text }))
            }
        }
    }
}

#[async_trait]
impl ContentGenerator for LlmContentGenerator {
    async fn generate(&self, kind: &str, request: &serde_json::Value) -> Result<serde_json::Value, AgentError> {
        self.author(format!(
            "Create a {kind}.\nRequest: {request}\n\
             Include a \"title\" field and structure the rest as fits a {kind}."
        ))
        .await
    }

    async fn refine(
        &self,
        kind: &str,
        current: &serde_json::Value,
        instruction: &str,
        scope: Option<&str>,
    ) -> Result<serde_json::Value, AgentError> {
        let scope = scope.unwrap_or("page");
        self.author(format!(
            "Revise this {kind}. Change only the {scope} the instruction refers to and keep \
             everything else identical.\nInstruction: {instruction}\nCurrent content: {current}\n\
             Reply with the complete revised object."
        ))
        .await
    }
}
