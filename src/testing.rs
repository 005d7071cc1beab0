//! Deterministic fakes for the collaborator and backend seams.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use crate::agent_core::router::RouterResult;
use crate::agent_core::AgentError;
use crate::collaborators::{
    Attachment, ChatPrompt, ChatResponder, ContentGenerator, IntentClassifier, PagePlan, PipelineContext,
    PipelineEvent, PipelineExecutor, PipelineGenerator,
};
use crate::inference::types::{ChatMessage, StreamChunk, ToolCall, ToolDefinition};
use crate::inference::{ChunkStream, GenerationBackend, InferenceError};

// ─── Generation Backend ─────────────────────────────────────────────────────

/// One scripted reaction of a model to one request.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Chunks(Vec<StreamChunk>),
    ProviderDown,
    /// Structured output that failed to parse; carries the raw text.
    Malformed(String),
    /// A request error that is neither the provider's fault nor malformed output.
    Rejected,
}

impl Step {
    pub(crate) fn text(text: &str) -> Self {
        Step::Chunks(vec![StreamChunk::text(text)])
    }

    pub(crate) fn call(name: &str, arguments: serde_json::Value) -> Self {
        Step::calls(vec![(name, arguments)])
    }

    pub(crate) fn calls(calls: Vec<(&str, serde_json::Value)>) -> Self {
        let calls = calls
            .into_iter()
            .map(|(name, arguments)| ToolCall {
                id: format!("call_{}", uuid::Uuid::new_v4().simple()),
                name: name.to_string(),
                arguments,
            })
            .collect();
        Step::Chunks(vec![StreamChunk::calls(calls)])
    }

    /// `submit_result` with the given status and message.
    pub(crate) fn submit(status: &str, message: &str) -> Self {
        Step::call(
            "submit_result",
            serde_json::json!({"status": status, "message": message}),
        )
    }
}

/// A backend whose models replay queued [`Step`]s. An exhausted queue
/// behaves like an unreachable model.
pub(crate) struct ScriptedBackend {
    chain: Vec<String>,
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    requests: Mutex<Vec<(String, Vec<ChatMessage>)>>,
}

impl ScriptedBackend {
    pub(crate) fn new(chain: &[&str]) -> Self {
        Self {
            chain: chain.iter().map(|s| s.to_string()).collect(),
            scripts: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with(self, model: &str, step: Step) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .push_back(step);
        self
    }

    /// Every request so far as `(model, messages)`.
    pub(crate) fn requests(&self) -> Vec<(String, Vec<ChatMessage>)> {
        self.requests.lock().unwrap().clone()
    }

    fn next(&self, model: &str, messages: &[ChatMessage]) -> Result<Vec<StreamChunk>, InferenceError> {
        self.requests
            .lock()
            .unwrap()
            .push((model.to_string(), messages.to_vec()));
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(model)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::ProviderDown);
        match step {
            Step::Chunks(chunks) => Ok(chunks),
            Step::ProviderDown => Err(InferenceError::ConnectionFailed {
                endpoint: format!("scripted://{model}"),
                reason: "connection refused".into(),
            }),
            Step::Malformed(raw) => Err(InferenceError::ToolCallParseError {
                raw_response: raw,
                reason: "invalid JSON".into(),
            }),
            Step::Rejected => Err(InferenceError::HttpError {
                status: 400,
                body: "context length exceeded".into(),
            }),
        }
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn stream_chat(
        &self,
        model_key: &str,
        messages: &[ChatMessage],
        _tools: Option<&[ToolDefinition]>,
    ) -> Result<ChunkStream, InferenceError> {
        let chunks = self.next(model_key, messages)?;
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }

    async fn complete(&self, model_key: &str, messages: &[ChatMessage]) -> Result<StreamChunk, InferenceError> {
        let chunks = self.next(model_key, messages)?;
        let mut merged = StreamChunk::default();
        for chunk in chunks {
            if let Some(token) = chunk.token {
                merged.token.get_or_insert_with(String::new).push_str(&token);
            }
            if let Some(calls) = chunk.tool_calls {
                merged.tool_calls.get_or_insert_with(Vec::new).extend(calls);
            }
            merged.finish_reason = chunk.finish_reason.or(merged.finish_reason.take());
        }
        Ok(merged)
    }

    fn model_chain(&self) -> Vec<String> {
        self.chain.clone()
    }
}

// ─── Collaborators ──────────────────────────────────────────────────────────

/// Always returns the same classification, or fails when `result` is `None`.
pub(crate) struct FixedClassifier {
    pub(crate) result: Option<RouterResult>,
}

impl FixedClassifier {
    pub(crate) fn new(intent: &str, confidence: f64) -> Self {
        Self {
            result: Some(RouterResult {
                intent: intent.into(),
                confidence,
                ..Default::default()
            }),
        }
    }

    pub(crate) fn with_strategy(mut self, strategy: &str) -> Self {
        if let Some(result) = &mut self.result {
            result.strategy = strategy.into();
        }
        self
    }

    pub(crate) fn failing() -> Self {
        Self { result: None }
    }
}

#[async_trait]
impl IntentClassifier for FixedClassifier {
    async fn classify(&self, _message: &str, _history: &str) -> Result<RouterResult, AgentError> {
        self.result
            .clone()
            .ok_or_else(|| AgentError::collaborator("intent classifier", "classifier offline"))
    }
}

/// Echoes the message back, tagged by which entry point answered.
pub(crate) struct EchoResponder;

#[async_trait]
impl ChatResponder for EchoResponder {
    async fn answer(&self, prompt: &ChatPrompt) -> Result<String, AgentError> {
        Ok(format!("echo: {}", prompt.message))
    }

    async fn followup(&self, prompt: &ChatPrompt) -> Result<String, AgentError> {
        Ok(format!("followup: {}", prompt.message))
    }
}

/// Builds content from the request fields without any model.
pub(crate) struct TemplateContent;

#[async_trait]
impl ContentGenerator for TemplateContent {
    async fn generate(&self, kind: &str, request: &serde_json::Value) -> Result<serde_json::Value, AgentError> {
        Ok(serde_json::json!({
            "title": format!("{kind}: {}", request["topic"].as_str().unwrap_or("untitled")),
            "request": request,
        }))
    }

    async fn refine(
        &self,
        _kind: &str,
        current: &serde_json::Value,
        instruction: &str,
        scope: Option<&str>,
    ) -> Result<serde_json::Value, AgentError> {
        let mut next = current.clone();
        if let Some(obj) = next.as_object_mut() {
            obj.insert("revision".into(), serde_json::json!(instruction));
            obj.insert("scope".into(), serde_json::json!(scope.unwrap_or("page")));
        }
        Ok(next)
    }
}

/// A pipeline that always plans `plan` and replays `events`.
pub(crate) struct ScriptedPipeline {
    pub(crate) plan: PagePlan,
    pub(crate) events: Vec<PipelineEvent>,
}

#[async_trait]
impl PipelineGenerator for ScriptedPipeline {
    async fn generate(
        &self,
        _prompt: &str,
        _language: &str,
        _attachments: &[Attachment],
    ) -> Result<(PagePlan, String), AgentError> {
        Ok((self.plan.clone(), "scripted-planner".into()))
    }
}

impl PipelineExecutor for ScriptedPipeline {
    fn execute(&self, _plan: &PagePlan, _context: &PipelineContext) -> BoxStream<'static, PipelineEvent> {
        stream::iter(self.events.clone()).boxed()
    }
}
