//! Tool-calling orchestrator.
//!
//! Drives one agentic turn against the model fallback chain:
//!
//! ```text
//! SelectModel → RunGeneration (+ToolMonitor) → CollectMessages → ValidateTerminalState
//!      ▲              │ provider error / failed repair                │
//!      └──────────────┘                                  Retry / Complete / Fail
//! ```
//!
//! Each attempt runs two tasks under one [`TaskGuard`]: the runner (model
//! rounds and tool execution) and a monitor that forwards [`ToolTracker`]
//! progress into the same event sink. The runner waits for the monitor to
//! queue each progress notice, so the sink sees events in the order they
//! happened. The terminal state arrives through the
//! `submit_result` tool; a plain-text reply with no tool call is an answer.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;

use super::errors::AgentError;
use super::text::{preview, truncate_utf8};
use super::tool_tracker::ToolTracker;
use super::toolset::CapabilityGroup;
use super::types::{Artifact, FinalResult, ResultStatus};
use super::validation::{decide, validate_terminal_state, ArtifactCall, RetryDecision, RetryPolicy, TurnTrace};
use crate::config::OrchestratorConfig;
use crate::inference::tool_call_parser::parse_lenient_json;
use crate::inference::types::{ChatMessage, ToolCall, ToolDefinition};
use crate::inference::{GenerationBackend, InferenceError};
use crate::protocol::{EventSink, TaskGuard, TurnEvent};
use crate::tools::{BuiltinTools, ToolContext, ToolError, ToolResolution, MIN_CORRECTION_SIMILARITY, SUBMIT_RESULT};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Maximum characters of a tool result sent back to the model.
const MAX_TOOL_RESULT_CHARS: usize = 6_000;

/// Capacity of the per-attempt tool progress channel.
const PROGRESS_CAPACITY: usize = 64;

const AGENT_SYSTEM_PROMPT: &str = "\
You are a teaching assistant that gets work done with tools.
- Produce quizzes, lesson content, and analyses by calling the matching tool. \
Never paste generated content into a reply instead of calling a tool.
- To change existing content, call patch_artifact with its artifact id.
- If something essential is missing and cannot be assumed, ask one question.
- End every turn by calling submit_result exactly once:
  status artifact_ready with artifact_ids when you created or changed an artifact,
  clarify_needed with clarify.question when you cannot proceed,
  answer_ready otherwise.";

const REPAIR_SYSTEM_PROMPT: &str = "\
The text below was meant to be a single JSON tool call but is malformed. \
Rewrite it as valid JSON and nothing else: either {\"name\": <tool>, \"arguments\": {...}} \
or, for the final result, {\"status\": ..., \"message\": ..., \"artifact_ids\": [...]}. \
Do not add commentary or code fences.";

// ─── Types ──────────────────────────────────────────────────────────────────

/// One tool-calling turn.
#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub conversation_id: String,
    /// The (possibly continuation-rewritten) user message.
    pub message: String,
    /// Trailing conversation window, oldest first.
    pub history: Vec<ChatMessage>,
    /// Capability groups selected by the toolset gate.
    pub groups: BTreeSet<CapabilityGroup>,
    /// Whether the caller asked for generated content.
    pub expect_artifact: bool,
    pub tool_context: ToolContext,
}

/// The validated result of a turn and how it was reached.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub result: FinalResult,
    /// Key of the model that produced the final result.
    pub model: String,
    pub fallback_count: usize,
    /// Soft validation failures accepted once the retry budget ran out.
    pub warnings: Vec<String>,
    /// Every artifact created or patched this turn, in order.
    pub artifacts: Vec<Artifact>,
    /// Executed tool names, in order.
    pub tool_calls: Vec<String>,
    /// The final message already went out as streamed text.
    pub answer_streamed: bool,
}

impl AgentOutcome {
    /// Compact description of the tools used, for the turn log.
    pub fn tool_summary(&self) -> Option<String> {
        (!self.tool_calls.is_empty()).then(|| self.tool_calls.join(", "))
    }
}

/// Why a model could not finish the turn.
#[derive(Debug)]
enum ModelFailure {
    /// Advance the fallback chain.
    Provider(String),
    /// Structured output did not parse; eligible for one repair pass.
    Malformed { raw: String, reason: String },
    /// Not the model's fault. Propagates.
    Fatal(AgentError),
}

impl From<InferenceError> for ModelFailure {
    fn from(e: InferenceError) -> Self {
        if e.is_malformed_output() {
            ModelFailure::Malformed {
                raw: e.raw_output().unwrap_or_default().to_string(),
                reason: e.to_string(),
            }
        } else if e.is_provider_error() {
            ModelFailure::Provider(e.to_string())
        } else {
            ModelFailure::Fatal(e.into())
        }
    }
}

/// State that survives across attempts within one turn.
#[derive(Debug, Default)]
struct TurnState {
    messages: Vec<ChatMessage>,
    trace: TurnTrace,
    artifacts: Vec<Artifact>,
    model_index: usize,
    fallback_count: usize,
    repairs_used: u32,
    answer_streamed: bool,
}

// ─── Orchestrator ───────────────────────────────────────────────────────────

/// Runs tool-calling turns. Cheap to clone; shared across requests.
#[derive(Clone)]
pub struct ToolOrchestrator {
    backend: Arc<dyn GenerationBackend>,
    tools: Arc<BuiltinTools>,
    config: OrchestratorConfig,
}

impl ToolOrchestrator {
    pub fn new(backend: Arc<dyn GenerationBackend>, tools: Arc<BuiltinTools>, config: OrchestratorConfig) -> Self {
        Self { backend, tools, config }
    }

    pub fn tools(&self) -> &Arc<BuiltinTools> {
        &self.tools
    }

    /// Run one turn to a validated terminal state.
    pub async fn run(&self, request: AgentRequest, sink: EventSink) -> Result<AgentOutcome, AgentError> {
        let definitions = self.tools.registry().definitions_for(&request.groups);
        tracing::info!(
            conversation_id = %request.conversation_id,
            groups = ?request.groups,
            tool_count = definitions.len(),
            expect_artifact = request.expect_artifact,
            "=== AGENT TURN START ==="
        );

        let mut state = TurnState {
            messages: initial_messages(&request),
            ..Default::default()
        };
        let policy = RetryPolicy {
            max_retries: self.config.validation_retries,
            accept_soft_failure: self.config.accept_soft_failure,
        };
        let mut retries_used = 0;
        let mut warnings = Vec::new();

        loop {
            let (next_state, attempt) = self
                .attempt(state, definitions.clone(), request.tool_context.clone(), sink.clone())
                .await?;
            state = next_state;
            let (model, mut result) = attempt?;

            if result.status == ResultStatus::ArtifactReady && result.artifact_ids.is_empty() {
                result.artifact_ids = state.trace.artifact_events.clone();
            }

            let verdict = validate_terminal_state(&result, &state.trace, request.expect_artifact);
            tracing::info!(
                model = %model,
                status = result.status.as_str(),
                ?verdict,
                retries_used,
                "=== VALIDATION VERDICT ==="
            );

            match decide(verdict, retries_used, &policy) {
                RetryDecision::Accept => return Ok(self.finish(state, model, result, warnings)),
                RetryDecision::AcceptWithWarning(reason) => {
                    tracing::warn!(reason = %reason, "accepting soft validation failure");
                    warnings.push(reason);
                    return Ok(self.finish(state, model, result, warnings));
                }
                RetryDecision::Retry(reason) => {
                    retries_used += 1;
                    state.messages.push(ChatMessage::user(format!(
                        "Your previous result was rejected: {reason}"
                    )));
                    sink.step().await;
                }
                RetryDecision::Fail(reason) => {
                    tracing::warn!(reason = %reason, "terminal state validation failed");
                    return Err(AgentError::ValidationFailed { reason });
                }
            }
        }
    }

    fn finish(&self, state: TurnState, model: String, result: FinalResult, warnings: Vec<String>) -> AgentOutcome {
        tracing::info!(
            model = %model,
            status = result.status.as_str(),
            fallback_count = state.fallback_count,
            artifacts = state.artifacts.len(),
            "=== AGENT TURN END ==="
        );
        AgentOutcome {
            result,
            model,
            fallback_count: state.fallback_count,
            warnings,
            artifacts: state.artifacts,
            tool_calls: state.trace.tool_calls,
            answer_streamed: state.answer_streamed,
        }
    }

    /// One attempt: the runner and the progress monitor, torn down together.
    ///
    /// The outer error is a task failure; the inner one is the runner's.
    async fn attempt(
        &self,
        state: TurnState,
        definitions: Vec<ToolDefinition>,
        ctx: ToolContext,
        sink: EventSink,
    ) -> Result<(TurnState, Result<(String, FinalResult), AgentError>), AgentError> {
        let (tracker, mut progress) = ToolTracker::channel(PROGRESS_CAPACITY);

        let monitor_sink = sink.clone();
        let monitor = tokio::spawn(async move {
            while let Some(notice) = progress.recv().await {
                monitor_sink.emit(TurnEvent::ToolProgress(notice.event.clone())).await;
                notice.ack();
            }
        });

        let mut runner = Runner {
            backend: self.backend.clone(),
            tools: self.tools.clone(),
            config: self.config,
            definitions,
            ctx,
            sink,
            tracker,
            state,
        };
        let runner = tokio::spawn(async move {
            let result = runner.run_chain().await;
            (runner.state, result)
        });

        let mut guard = TaskGuard::new();
        guard.watch(&runner);
        guard.watch(&monitor);

        let outcome = runner.await.map_err(|e| AgentError::GenerationFailed {
            reason: format!("generation runner failed: {e}"),
        })?;
        // The runner dropped its tracker; drain what is left before returning.
        let _ = monitor.await;
        Ok(outcome)
    }
}

fn initial_messages(request: &AgentRequest) -> Vec<ChatMessage> {
    let mut system = AGENT_SYSTEM_PROMPT.to_string();
    if let Some(latest) = request.tool_context.artifact_ids.last() {
        system.push_str(&format!("\nThe most recent artifact in this conversation is {latest}."));
    }
    if !request.tool_context.entities.is_empty() {
        let names: Vec<String> = request
            .tool_context
            .entities
            .iter()
            .map(|e| format!("{} ({})", e.display_name, e.entity_id))
            .collect();
        system.push_str(&format!("\nResolved entities: {}.", names.join(", ")));
    }

    let mut messages = Vec::with_capacity(request.history.len() + 2);
    messages.push(ChatMessage::system(system));
    messages.extend(request.history.iter().cloned());
    messages.push(ChatMessage::user(request.message.clone()));
    messages
}

// ─── Runner ─────────────────────────────────────────────────────────────────

struct Runner {
    backend: Arc<dyn GenerationBackend>,
    tools: Arc<BuiltinTools>,
    config: OrchestratorConfig,
    definitions: Vec<ToolDefinition>,
    ctx: ToolContext,
    sink: EventSink,
    tracker: ToolTracker,
    state: TurnState,
}

impl Runner {
    /// Walk the chain from the current model until one produces a result.
    async fn run_chain(&mut self) -> Result<(String, FinalResult), AgentError> {
        let chain = self.backend.model_chain();
        if chain.is_empty() {
            return Err(AgentError::GenerationFailed {
                reason: "no models configured".into(),
            });
        }

        let mut seed: Option<Vec<ToolCall>> = None;
        loop {
            let Some(model) = chain.get(self.state.model_index).cloned() else {
                return Err(AgentError::GenerationFailed {
                    reason: format!("all models in the fallback chain failed (tried: {})", chain.join(", ")),
                });
            };

            let reason = match self.run_model(&model, seed.take()).await {
                Ok(result) => return Ok((model, result)),
                Err(ModelFailure::Fatal(e)) => return Err(e),
                Err(ModelFailure::Provider(reason)) => reason,
                Err(ModelFailure::Malformed { raw, reason }) => {
                    if self.state.repairs_used < self.config.repair_attempts {
                        self.state.repairs_used += 1;
                        match self.repair(&model, &raw).await {
                            Some(call) => {
                                tracing::info!(model = %model, tool = %call.name, "malformed output repaired");
                                seed = Some(vec![call]);
                                continue;
                            }
                            None => format!("{reason} (repair failed)"),
                        }
                    } else {
                        reason
                    }
                }
            };

            let next = chain.get(self.state.model_index + 1).cloned();
            tracing::warn!(
                from = %model,
                to = next.as_deref().unwrap_or("none"),
                reason = %reason,
                "=== MODEL FALLBACK ==="
            );
            if let Some(to) = &next {
                self.sink
                    .data("fallback", json!({ "from": model, "to": to, "reason": reason }))
                    .await;
                self.state.fallback_count += 1;
            }
            self.state.model_index += 1;
        }
    }

    /// Generate → execute rounds on one model until a terminal result.
    ///
    /// `seed` stands in for the first round's model output.
    async fn run_model(&mut self, model: &str, mut seed: Option<Vec<ToolCall>>) -> Result<FinalResult, ModelFailure> {
        for round in 0..self.config.max_tool_rounds {
            if round > 0 {
                self.sink.step().await;
            }

            let (text, calls) = match seed.take() {
                Some(calls) => (String::new(), calls),
                None => self.generate(model).await?,
            };
            tracing::info!(
                model = %model,
                round,
                text_len = text.len(),
                tool_names = ?calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                "=== MODEL RESPONSE ==="
            );

            if calls.is_empty() {
                let answer = text.trim();
                if answer.is_empty() {
                    return Err(ModelFailure::Provider(format!("{model} returned an empty response")));
                }
                self.state.messages.push(ChatMessage::assistant(answer));
                self.state.answer_streamed = true;
                return Ok(FinalResult::answer(answer));
            }

            let text = (!text.trim().is_empty()).then_some(text);
            self.state.messages.push(ChatMessage::assistant_tool_calls(text, &calls));

            let mut terminal = None;
            for call in &calls {
                let resolution = self.tools.registry().resolve(&call.name, MIN_CORRECTION_SIMILARITY);
                if resolution.resolved_name() == Some(SUBMIT_RESULT) {
                    let reply = match serde_json::from_value::<FinalResult>(call.arguments.clone()) {
                        Ok(result) => {
                            terminal = Some(result);
                            json!({ "accepted": true })
                        }
                        Err(e) => json!({ "error": format!("invalid submit_result arguments: {e}") }),
                    };
                    self.state
                        .messages
                        .push(ChatMessage::tool_result(call.id.clone(), reply.to_string()));
                    continue;
                }

                let output = self.invoke(call, resolution).await;
                let content = output.to_string();
                self.state.messages.push(ChatMessage::tool_result(
                    call.id.clone(),
                    truncate_utf8(&content, MAX_TOOL_RESULT_CHARS),
                ));
            }

            if let Some(result) = terminal {
                self.state.answer_streamed = false;
                return Ok(result);
            }
        }

        Err(ModelFailure::Fatal(AgentError::GenerationFailed {
            reason: format!("no terminal result after {} tool rounds", self.config.max_tool_rounds),
        }))
    }

    /// One streamed completion. Text is forwarded until the first tool call.
    async fn generate(&mut self, model: &str) -> Result<(String, Vec<ToolCall>), ModelFailure> {
        let tools = (!self.definitions.is_empty()).then_some(self.definitions.as_slice());
        let mut stream = self.backend.stream_chat(model, &self.state.messages, tools).await?;

        let mut text = String::new();
        let mut calls: Vec<ToolCall> = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if let Some(token) = chunk.token {
                if calls.is_empty() {
                    self.sink.text(token.clone()).await;
                }
                text.push_str(&token);
            }
            for call in chunk.tool_calls.unwrap_or_default() {
                if !calls.iter().any(|existing| existing.id == call.id) {
                    calls.push(call);
                }
            }
        }
        Ok((text, calls))
    }

    /// Execute one non-terminal tool call. Failures become the tool result.
    async fn invoke(&mut self, call: &ToolCall, resolution: ToolResolution) -> serde_json::Value {
        let name = match resolution {
            ToolResolution::Exact(name) => name,
            ToolResolution::Corrected { resolved, original, score } => {
                tracing::info!(original = %original, resolved = %resolved, score, "corrected tool name");
                resolved
            }
            ToolResolution::NotFound { original, suggestions } => {
                tracing::warn!(tool = %original, ?suggestions, "model called an unknown tool");
                return ToolError::UnknownTool {
                    name: original,
                    suggestions,
                }
                .to_tool_result();
            }
        };

        self.sink
            .emit(TurnEvent::ToolInputStart {
                call_id: call.id.clone(),
                tool_name: name.clone(),
            })
            .await;
        self.sink
            .emit(TurnEvent::ToolInputAvailable {
                call_id: call.id.clone(),
                tool_name: name.clone(),
                input: call.arguments.clone(),
            })
            .await;

        self.state.trace.tool_calls.push(name.clone());
        let produces_artifact = self.tools.registry().produces_artifact(&name);
        let mut emitted_artifact = None;

        let executed = self
            .tracker
            .track(&name, self.tools.execute(&name, &call.arguments, &self.ctx))
            .await;
        let output = match executed {
            Ok(output) => {
                if let Some(artifact) = output.artifact {
                    match serde_json::to_value(&artifact) {
                        Ok(payload) => self.sink.data("artifact", payload).await,
                        Err(e) => tracing::error!(error = %e, "artifact serialization failed"),
                    }
                    self.state.trace.artifact_events.push(artifact.artifact_id.clone());
                    emitted_artifact = Some(artifact.artifact_id.clone());
                    if !self.ctx.artifact_ids.contains(&artifact.artifact_id) {
                        self.ctx.artifact_ids.push(artifact.artifact_id.clone());
                    }
                    self.state.artifacts.push(artifact);
                }
                output.value
            }
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, "tool failed");
                e.to_tool_result()
            }
        };

        if produces_artifact {
            self.state.trace.artifact_tool_calls.push(ArtifactCall {
                tool: name.clone(),
                artifact_id: emitted_artifact,
            });
        }

        self.sink
            .emit(TurnEvent::ToolOutput {
                call_id: call.id.clone(),
                output: output.clone(),
            })
            .await;
        output
    }

    /// Ask `model` to rewrite malformed output as a single valid tool call.
    async fn repair(&self, model: &str, raw: &str) -> Option<ToolCall> {
        if raw.trim().is_empty() {
            return None;
        }
        tracing::info!(model = %model, raw = %preview(raw, 200), "attempting repair of malformed output");
        let messages = [ChatMessage::system(REPAIR_SYSTEM_PROMPT), ChatMessage::user(raw)];
        let chunk = match self.backend.complete(model, &messages).await {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(model = %model, error = %e, "repair request failed");
                return None;
            }
        };
        let value = parse_lenient_json(chunk.token.as_deref().unwrap_or_default())?;
        repaired_call(value)
    }
}

/// Interpret a repaired JSON value as a tool call.
fn repaired_call(value: serde_json::Value) -> Option<ToolCall> {
    let id = format!("call_{}", uuid::Uuid::new_v4().simple());
    if let Some(name) = value.get("name").and_then(|n| n.as_str()) {
        let arguments = value.get("arguments").cloned().unwrap_or_else(|| json!({}));
        if !arguments.is_object() {
            return None;
        }
        return Some(ToolCall {
            id,
            name: name.to_string(),
            arguments,
        });
    }
    value.get("status").is_some().then(|| ToolCall {
        id,
        name: SUBMIT_RESULT.to_string(),
        arguments: value,
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────
