//! Turn dispatch for the chat endpoints.
//!
//! One turn: load the session, rewrite a short reply to a pending
//! clarification into a directive, classify, route by confidence, then run
//! exactly one of the chat, clarify, or build branches. Build turns either run
//! the page pipeline (when the classifier asked for it and one is wired) or the
//! tool-calling orchestrator. The session is saved after every turn, failed
//! ones included.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::agent_core::conversation::CLARIFY_ACTION;
use crate::agent_core::entity_resolver::{ResolvedEntity, MISSING_CLASS};
use crate::agent_core::router::{
    self, RouterResult, INTENT_CHAT_SMALLTALK, INTENT_CLARIFY, INTENT_CONTENT_GENERATE, INTENT_CONTENT_REFINE,
    INTENT_PAGE_BUILD, INTENT_PAGE_FOLLOWUP, INTENT_QUIZ_GENERATE,
};
use crate::agent_core::toolset::{select_groups, TurnFlags};
use crate::agent_core::types::{ArtifactDraft, ClarifyPayload, ConversationSession, ResultStatus, Turn};
use crate::agent_core::{
    AgentError, AgentRequest, ArtifactService, EntityResolver, ResolveContext, ResolveResult, Roster,
    SessionStore, ToolOrchestrator,
};
use crate::collaborators::{
    detect_language, Attachment, ChatPrompt, ChatResponder, IntentClassifier, PipelineContext, PipelineEvent,
    PipelineExecutor, PipelineGenerator,
};
use crate::config::{ResolverConfig, RouterThresholds, SessionConfig};
use crate::inference::types::ChatMessage;
use crate::protocol::{EventSink, TurnEvent};
use crate::tools::ToolContext;

/// Context key holding the class the user is currently working in.
pub const CLASS_ID_KEY: &str = "class_id";

/// Strategy value that selects the page pipeline.
const PIPELINE_STRATEGY: &str = "pipeline";

/// Intents whose turn must end with an artifact. Analysis may answer in text.
const ARTIFACT_INTENTS: &[&str] = &[
    INTENT_QUIZ_GENERATE,
    INTENT_CONTENT_GENERATE,
    INTENT_PAGE_BUILD,
    INTENT_CONTENT_REFINE,
];

// ─── Request / Response Types ───────────────────────────────────────────────

/// Body of `POST /api/chat` and `POST /api/chat/stream`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatRequest {
    /// Omitted or empty starts a new conversation.
    pub conversation_id: Option<String>,
    pub message: String,
    /// BCP-47 tag; detected from the message when absent.
    pub language: Option<String>,
    pub attachments: Vec<Attachment>,
    /// Merged into the session context before the turn runs.
    pub context: BTreeMap<String, serde_json::Value>,
    /// Classes, students and assignments the message may refer to.
    pub roster: Option<Roster>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnMode {
    Chat,
    Clarify,
    Build,
}

/// What a finished turn produced. Also the body of the synchronous response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnSummary {
    pub conversation_id: String,
    pub mode: TurnMode,
    /// `chat`, `clarify`, `build` or `answer`.
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_kind: Option<String>,
    pub response: String,
    pub artifact_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarify: Option<ClarifyPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entities: Option<ResolveResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip)]
    tool_summary: Option<String>,
}

impl TurnSummary {
    fn new(conversation_id: &str, mode: TurnMode, action: &str, response: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            mode,
            action: action.to_string(),
            chat_kind: None,
            response: response.into(),
            artifact_ids: Vec::new(),
            clarify: None,
            entities: None,
            model: None,
            warnings: Vec::new(),
            tool_summary: None,
        }
    }
}

// ─── Dispatcher ─────────────────────────────────────────────────────────────

/// The page pipeline pair. Both halves or neither.
#[derive(Clone)]
pub struct Pipeline {
    pub generator: Arc<dyn PipelineGenerator>,
    pub executor: Arc<dyn PipelineExecutor>,
}

/// Everything a turn talks to.
#[derive(Clone)]
pub struct Services {
    pub sessions: Arc<dyn SessionStore>,
    pub artifacts: Arc<ArtifactService>,
    pub classifier: Arc<dyn IntentClassifier>,
    pub responder: Arc<dyn ChatResponder>,
    pub pipeline: Option<Pipeline>,
    pub orchestrator: ToolOrchestrator,
}

/// Per-turn settings taken from the gateway config.
#[derive(Debug, Clone, Default)]
pub struct DispatchSettings {
    pub router: RouterThresholds,
    pub resolver: ResolverConfig,
    pub session: SessionConfig,
}

/// Runs turns. Shared by every request.
pub struct Dispatcher {
    services: Services,
    settings: DispatchSettings,
}

/// Per-turn values the branches share.
struct TurnInput {
    conversation_id: String,
    /// The message the branches act on (the directive when continuing).
    message: String,
    language: String,
    attachments: Vec<Attachment>,
    roster: Option<Roster>,
}

impl Dispatcher {
    pub fn new(services: Services, settings: DispatchSettings) -> Self {
        Self { services, settings }
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.services.sessions
    }

    pub fn artifacts(&self) -> &Arc<ArtifactService> {
        &self.services.artifacts
    }

    /// Run one turn end to end, reporting progress through `sink`.
    pub async fn run_turn(&self, request: ChatRequest, sink: EventSink) -> Result<TurnSummary, AgentError> {
        if request.message.trim().is_empty() && request.attachments.is_empty() {
            return Err(AgentError::InvalidRequest {
                reason: "message must not be empty".into(),
            });
        }

        let conversation_id = request
            .conversation_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut session = self.services.sessions.load_or_create(&conversation_id).await?;
        let language = request
            .language
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| detect_language(&request.message).to_string());

        tracing::info!(
            conversation_id = %conversation_id,
            prior_turns = session.turns.len(),
            language = %language,
            attachments = request.attachments.len(),
            "=== TURN START ==="
        );

        let window = self.settings.session.max_turns;
        let directive = session.continuation_directive(&request.message, self.settings.session.continuation_max_chars);
        let history_text = session.window_text(window);
        let history = session.window_messages(window);

        session.merge_context(request.context);
        session.append(Turn::user(request.message.clone()).with_attachments(request.attachments.len() as u32));

        let input = TurnInput {
            conversation_id: conversation_id.clone(),
            message: directive.clone().unwrap_or_else(|| request.message.clone()),
            language,
            attachments: request.attachments,
            roster: request.roster,
        };
        if directive.is_some() {
            tracing::info!(conversation_id = %conversation_id, "continuing pending clarification");
        }

        let outcome = self.dispatch(&mut session, &input, &history_text, history, &sink).await;

        match outcome {
            Ok(summary) => {
                session.append(
                    Turn::assistant(summary.response.clone(), summary.action.clone())
                        .with_tool_summary(summary.tool_summary.clone()),
                );
                self.services.sessions.save(&session).await?;
                tracing::info!(
                    conversation_id = %conversation_id,
                    mode = ?summary.mode,
                    action = %summary.action,
                    artifacts = summary.artifact_ids.len(),
                    "=== TURN END ==="
                );
                Ok(summary)
            }
            Err(e) => {
                tracing::error!(conversation_id = %conversation_id, error = %e, "turn failed");
                session.append(Turn::assistant(e.to_string(), "error"));
                if let Err(save_err) = self.services.sessions.save(&session).await {
                    tracing::warn!(error = %save_err, "failed to save session after turn failure");
                }
                Err(e)
            }
        }
    }

    async fn dispatch(
        &self,
        session: &mut ConversationSession,
        input: &TurnInput,
        history_text: &str,
        history: Vec<ChatMessage>,
        sink: &EventSink,
    ) -> Result<TurnSummary, AgentError> {
        let classified = match self.services.classifier.classify(&input.message, history_text).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, "intent classification failed, falling back to chat");
                RouterResult::fallback_chat()
            }
        };
        let routed = router::route(classified.clone(), &input.message, &self.settings.router);
        tracing::info!(
            intent = %classified.intent,
            confidence = classified.confidence,
            routed_intent = %routed.intent,
            should_build = routed.should_build,
            strategy = %routed.strategy,
            "=== ROUTING DECISION ==="
        );
        session.last_intent = Some(routed.intent.clone());
        sink.reasoning(router::explain(&classified, &routed)).await;

        if routed.intent == INTENT_CLARIFY {
            let question = routed
                .clarifying_question
                .clone()
                .filter(|q| !q.trim().is_empty())
                .unwrap_or_else(|| router::generic_clarifying_question(&input.message).into());
            return Ok(self.clarify(input, question, clarify_options(&routed), sink).await);
        }
        if !routed.should_build || !router::is_build_capable(&routed.intent) {
            return self.chat(session, input, &routed, history, sink).await;
        }
        self.build(session, input, &routed, history, sink).await
    }

    // ─── Chat ───────────────────────────────────────────────────────────────

    async fn chat(
        &self,
        session: &ConversationSession,
        input: &TurnInput,
        routed: &RouterResult,
        history: Vec<ChatMessage>,
        sink: &EventSink,
    ) -> Result<TurnSummary, AgentError> {
        let chat_kind = if routed.intent == INTENT_PAGE_FOLLOWUP {
            "followup"
        } else if routed.intent == INTENT_CHAT_SMALLTALK {
            "smalltalk"
        } else {
            "qa"
        };
        sink.data("action", json!({ "action": "chat", "chatKind": chat_kind })).await;

        let prompt = ChatPrompt {
            message: input.message.clone(),
            context: session.context.clone(),
            language: input.language.clone(),
            attachments: input.attachments.clone(),
            history,
        };
        let reply = if chat_kind == "followup" {
            self.services.responder.followup(&prompt).await?
        } else {
            self.services.responder.answer(&prompt).await?
        };
        sink.text(reply.clone()).await;

        let mut summary = TurnSummary::new(&input.conversation_id, TurnMode::Chat, "chat", reply);
        summary.chat_kind = Some(chat_kind.to_string());
        Ok(summary)
    }

    // ─── Clarify ────────────────────────────────────────────────────────────

    async fn clarify(&self, input: &TurnInput, question: String, options: Vec<String>, sink: &EventSink) -> TurnSummary {
        let payload = ClarifyPayload { question, options };
        sink.data("clarify", json!({ "question": payload.question, "options": payload.options }))
            .await;
        sink.text(payload.question.clone()).await;

        let mut summary = TurnSummary::new(
            &input.conversation_id,
            TurnMode::Clarify,
            CLARIFY_ACTION,
            payload.question.clone(),
        );
        summary.clarify = Some(payload);
        summary
    }

    // ─── Build ──────────────────────────────────────────────────────────────

    async fn build(
        &self,
        session: &mut ConversationSession,
        input: &TurnInput,
        routed: &RouterResult,
        history: Vec<ChatMessage>,
        sink: &EventSink,
    ) -> Result<TurnSummary, AgentError> {
        let resolved = self.resolve_entities(session, input, sink).await;
        if let Some(result) = &resolved {
            if result.missing_context.iter().any(|m| m == MISSING_CLASS) {
                let question = missing_class_question(&input.language);
                let mut summary = self.clarify(input, question, Vec::new(), sink).await;
                summary.entities = resolved;
                return Ok(summary);
            }
        }

        let mut summary = match (&self.services.pipeline, routed.strategy == PIPELINE_STRATEGY) {
            (Some(pipeline), true) => {
                self.run_pipeline(pipeline, session, input, resolved.as_ref(), sink).await?
            }
            (None, true) => {
                tracing::info!("no page pipeline configured, using the agent path");
                self.run_agent(session, input, routed, resolved.as_ref(), history, sink).await?
            }
            _ => self.run_agent(session, input, routed, resolved.as_ref(), history, sink).await?,
        };
        summary.entities = resolved;
        Ok(summary)
    }

    async fn resolve_entities(
        &self,
        session: &ConversationSession,
        input: &TurnInput,
        sink: &EventSink,
    ) -> Option<ResolveResult> {
        let roster = input.roster.as_ref().filter(|r| !r.classes.is_empty())?;
        let ctx = ResolveContext {
            class_id: session
                .context
                .get(CLASS_ID_KEY)
                .and_then(|v| v.as_str())
                .map(String::from),
        };
        let result = EntityResolver::new(roster, self.settings.resolver.fuzzy_threshold).resolve(&input.message, &ctx);
        tracing::info!(
            entities = result.entities.len(),
            ambiguous = result.is_ambiguous,
            scope = ?result.scope_mode,
            missing = ?result.missing_context,
            "entities resolved"
        );
        match serde_json::to_value(&result) {
            Ok(payload) => sink.data("entities", payload).await,
            Err(e) => tracing::error!(error = %e, "entity serialization failed"),
        }
        Some(result)
    }

    async fn run_pipeline(
        &self,
        pipeline: &Pipeline,
        session: &mut ConversationSession,
        input: &TurnInput,
        resolved: Option<&ResolveResult>,
        sink: &EventSink,
    ) -> Result<TurnSummary, AgentError> {
        sink.data("action", json!({ "action": "build", "strategy": PIPELINE_STRATEGY }))
            .await;

        let (plan, planner) = pipeline
            .generator
            .generate(&input.message, &input.language, &input.attachments)
            .await?;
        tracing::info!(planner = %planner, title = %plan.title, sections = plan.sections.len(), "page plan ready");
        sink.data("page-plan", json!({ "plan": plan, "planner": planner })).await;

        let context = PipelineContext {
            conversation_id: input.conversation_id.clone(),
            language: input.language.clone(),
            entities: resolved.map(|r| r.entities.clone()).unwrap_or_default(),
            context: session.context.clone(),
        };
        let mut events = pipeline.executor.execute(&plan, &context);
        let mut content = None;
        let mut tools = Vec::new();
        while let Some(event) = events.next().await {
            match event {
                PipelineEvent::Phase { phase, message } => {
                    sink.data("phase", json!({ "phase": phase, "message": message })).await;
                }
                PipelineEvent::ToolCall { call_id, tool, input } => {
                    sink.emit(TurnEvent::ToolInputStart {
                        call_id: call_id.clone(),
                        tool_name: tool.clone(),
                    })
                    .await;
                    sink.emit(TurnEvent::ToolInputAvailable {
                        call_id,
                        tool_name: tool.clone(),
                        input,
                    })
                    .await;
                    tools.push(tool);
                }
                PipelineEvent::ToolResult { call_id, output } => {
                    sink.emit(TurnEvent::ToolOutput { call_id, output }).await;
                }
                PipelineEvent::BlockDelta { block_id, delta } => {
                    sink.data("block-delta", json!({ "blockId": block_id, "delta": delta })).await;
                }
                PipelineEvent::Complete { content: page } => content = Some(page),
                PipelineEvent::Error { message } => {
                    tracing::warn!(error = %message, "pipeline reported an error");
                    sink.error(message).await;
                }
            }
        }

        let content = content.ok_or_else(|| AgentError::collaborator("page pipeline", "finished without a page"))?;
        let artifact = self
            .services
            .artifacts
            .create(ArtifactDraft {
                artifact_type: "page".into(),
                content_format: "json".into(),
                content,
                resources: input.attachments.iter().filter_map(|a| a.url.clone()).collect(),
            })
            .await?;
        match serde_json::to_value(&artifact) {
            Ok(payload) => sink.data("artifact", payload).await,
            Err(e) => tracing::error!(error = %e, "artifact serialization failed"),
        }
        session.record_artifacts(vec![artifact.artifact_id.clone()]);

        let response = page_ready_message(&input.language, &plan.title);
        sink.text(response.clone()).await;

        let mut summary = TurnSummary::new(&input.conversation_id, TurnMode::Build, "build", response);
        summary.artifact_ids = vec![artifact.artifact_id];
        summary.model = Some(planner);
        summary.tool_summary = (!tools.is_empty()).then(|| tools.join(", "));
        Ok(summary)
    }

    async fn run_agent(
        &self,
        session: &mut ConversationSession,
        input: &TurnInput,
        routed: &RouterResult,
        resolved: Option<&ResolveResult>,
        history: Vec<ChatMessage>,
        sink: &EventSink,
    ) -> Result<TurnSummary, AgentError> {
        let entities: Vec<ResolvedEntity> = resolved.map(|r| r.entities.clone()).unwrap_or_default();
        let artifact_ids = session.last_artifact_ids();
        let flags = TurnFlags {
            has_artifact: !artifact_ids.is_empty(),
            has_context_id: !entities.is_empty() || session.context.contains_key(CLASS_ID_KEY),
        };
        let groups = select_groups(&input.message, &flags);
        sink.data(
            "action",
            json!({ "action": "build", "strategy": "agent", "intent": routed.intent, "groups": groups }),
        )
        .await;

        let request = AgentRequest {
            conversation_id: input.conversation_id.clone(),
            message: input.message.clone(),
            history,
            groups,
            expect_artifact: ARTIFACT_INTENTS.contains(&routed.intent.as_str()),
            tool_context: ToolContext {
                conversation_id: input.conversation_id.clone(),
                history: session.window_text(self.settings.session.max_turns),
                artifact_ids,
                entities,
                context: session.context.clone(),
            },
        };
        let outcome = self.services.orchestrator.run(request, sink.clone()).await?;

        for warning in &outcome.warnings {
            sink.data("validation-warning", json!({ "reason": warning })).await;
        }
        if !outcome.answer_streamed {
            sink.text(outcome.result.message.clone()).await;
        }

        let produced: Vec<String> = outcome.artifacts.iter().map(|a| a.artifact_id.clone()).collect();
        session.record_artifacts(produced);

        let (mode, action) = match outcome.result.status {
            ResultStatus::ArtifactReady => (TurnMode::Build, "build"),
            ResultStatus::ClarifyNeeded => (TurnMode::Clarify, CLARIFY_ACTION),
            ResultStatus::AnswerReady => (TurnMode::Build, "answer"),
        };
        let response = match outcome.result.clarify_question() {
            Some(question) if mode == TurnMode::Clarify => question.to_string(),
            _ => outcome.result.message.clone(),
        };
        if let Some(clarify) = &outcome.result.clarify {
            sink.data("clarify", json!({ "question": clarify.question, "options": clarify.options }))
                .await;
        }

        let mut summary = TurnSummary::new(&input.conversation_id, mode, action, response);
        summary.artifact_ids = outcome.result.artifact_ids.clone();
        summary.clarify = outcome.result.clarify.clone();
        summary.model = Some(outcome.model.clone());
        summary.warnings = outcome.warnings.clone();
        summary.tool_summary = outcome.tool_summary();
        Ok(summary)
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Suggested answers the classifier attached to a clarification.
fn clarify_options(routed: &RouterResult) -> Vec<String> {
    routed
        .parameters
        .get("options")
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

fn is_chinese(language: &str) -> bool {
    language.starts_with("zh")
}

fn missing_class_question(language: &str) -> String {
    if is_chinese(language) {
        "请问是哪个班级？".into()
    } else {
        "Which class do you mean?".into()
    }
}

fn page_ready_message(language: &str, title: &str) -> String {
    match (is_chinese(language), title.trim().is_empty()) {
        (true, true) => "页面已生成。".into(),
        (true, false) => format!("页面「{title}」已生成。"),
        (false, true) => "Your page is ready.".into(),
        (false, false) => format!("Your page \"{title}\" is ready."),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::entity_resolver::{ClassRecord, StudentRecord};
    use crate::agent_core::{InMemoryArtifactStore, InMemorySessionStore};
    use crate::collaborators::PagePlan;
    use crate::config::{OrchestratorConfig, StreamConfig};
    use crate::protocol::{spawn_turn_stream, StreamSettings};
    use crate::testing::{EchoResponder, FixedClassifier, ScriptedBackend, ScriptedPipeline, Step, TemplateContent};
    use crate::tools::{BuiltinTools, ToolRegistry};
    use tokio::sync::mpsc;

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        backend: Arc<ScriptedBackend>,
    }

    fn harness(classifier: FixedClassifier, backend: ScriptedBackend, pipeline: Option<ScriptedPipeline>) -> Harness {
        let backend = Arc::new(backend);
        let artifacts = Arc::new(ArtifactService::new(Arc::new(InMemoryArtifactStore::new())));
        let tools = Arc::new(BuiltinTools::new(
            ToolRegistry::builtin(),
            artifacts.clone(),
            Arc::new(TemplateContent),
        ));
        let orchestrator = ToolOrchestrator::new(backend.clone(), tools, OrchestratorConfig::default());
        let pipeline = pipeline.map(|p| {
            let p = Arc::new(p);
            Pipeline {
                generator: p.clone(),
                executor: p,
            }
        });
        let services = Services {
            sessions: Arc::new(InMemorySessionStore::new()),
            artifacts,
            classifier: Arc::new(classifier),
            responder: Arc::new(EchoResponder),
            pipeline,
            orchestrator,
        };
        Harness {
            dispatcher: Arc::new(Dispatcher::new(services, DispatchSettings::default())),
            backend,
        }
    }

    fn request(conversation_id: &str, message: &str) -> ChatRequest {
        ChatRequest {
            conversation_id: Some(conversation_id.into()),
            message: message.into(),
            ..Default::default()
        }
    }

    /// Run a turn and collect the events it emitted.
    async fn run_collecting(dispatcher: &Dispatcher, req: ChatRequest) -> (Result<TurnSummary, AgentError>, Vec<TurnEvent>) {
        let (tx, mut rx) = mpsc::channel(256);
        let result = dispatcher.run_turn(req, EventSink::new(tx)).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (result, events)
    }

    fn data_names(events: &[TurnEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::Data { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    fn frame_types(frames: &[String]) -> Vec<String> {
        frames
            .iter()
            .map(|f| {
                let body = f.trim_start_matches("data: ").trim_end();
                serde_json::from_str::<serde_json::Value>(body)
                    .ok()
                    .and_then(|v| v["type"].as_str().map(String::from))
                    .unwrap_or_else(|| body.to_string())
            })
            .collect()
    }

    #[tokio::test]
    async fn test_smalltalk_streams_chat_frames_in_order() {
        let h = harness(FixedClassifier::new("chat_smalltalk", 0.95), ScriptedBackend::new(&["m1"]), None);
        let settings = StreamSettings::from(&StreamConfig::default());
        let dispatcher = h.dispatcher.clone();
        let stream = spawn_turn_stream(settings, "msg-1".into(), move |sink| async move {
            dispatcher.run_turn(request("conv-1", "你好"), sink).await.map(|_| ())
        });
        let frames: Vec<String> = stream.collect().await;

        assert_eq!(
            frame_types(&frames),
            vec![
                "start",
                "start-step",
                "reasoning-start",
                "reasoning-delta",
                "reasoning-end",
                "data-action",
                "text-start",
                "text-delta",
                "text-end",
                "finish-step",
                "finish",
                "[DONE]",
            ]
        );
        assert!(frames.iter().any(|f| f.contains("\"chatKind\":\"smalltalk\"")));
        assert!(frames.iter().any(|f| f.contains("echo: 你好")));
    }

    #[tokio::test]
    async fn test_low_confidence_build_falls_back_to_chat() {
        let h = harness(FixedClassifier::new("quiz_generate", 0.2), ScriptedBackend::new(&["m1"]), None);
        let (result, _) = run_collecting(&h.dispatcher, request("conv-1", "maybe a quiz?")).await;
        let summary = result.unwrap();
        assert_eq!(summary.mode, TurnMode::Chat);
        assert_eq!(summary.chat_kind.as_deref(), Some("qa"));
        assert_eq!(summary.response, "echo: maybe a quiz?");
        assert!(h.backend.requests().is_empty());
    }

    #[tokio::test]
    async fn test_classifier_failure_routes_to_chat() {
        let h = harness(FixedClassifier::failing(), ScriptedBackend::new(&["m1"]), None);
        let (result, _) = run_collecting(&h.dispatcher, request("conv-1", "hello")).await;
        let summary = result.unwrap();
        assert_eq!(summary.mode, TurnMode::Chat);
        assert_eq!(summary.response, "echo: hello");
    }

    #[tokio::test]
    async fn test_page_followup_uses_followup_responder() {
        let h = harness(FixedClassifier::new("page_followup", 0.9), ScriptedBackend::new(&["m1"]), None);
        let (result, events) = run_collecting(&h.dispatcher, request("conv-1", "what does section 2 mean?")).await;
        let summary = result.unwrap();
        assert_eq!(summary.chat_kind.as_deref(), Some("followup"));
        assert_eq!(summary.response, "followup: what does section 2 mean?");
        assert_eq!(data_names(&events), vec!["action"]);
    }

    #[tokio::test]
    async fn test_classifier_clarify_without_question_still_asks() {
        let h = harness(FixedClassifier::new("clarify", 0.95), ScriptedBackend::new(&["m1"]), None);
        let (result, _) = run_collecting(&h.dispatcher, request("conv-1", "make something")).await;
        let summary = result.unwrap();
        assert_eq!(summary.mode, TurnMode::Clarify);
        assert!(!summary.response.trim().is_empty());
        assert!(h.backend.requests().is_empty());
    }

    #[tokio::test]
    async fn test_mid_confidence_clarifies_then_continues() {
        let h = harness(FixedClassifier::new("quiz_generate", 0.6), ScriptedBackend::new(&["m1"]), None);
        let (result, events) = run_collecting(&h.dispatcher, request("conv-1", "make a quiz")).await;
        let summary = result.unwrap();
        assert_eq!(summary.mode, TurnMode::Clarify);
        assert!(!summary.response.is_empty());
        assert_eq!(summary.clarify.as_ref().unwrap().question, summary.response);
        assert!(data_names(&events).contains(&"clarify"));

        let session = h.dispatcher.sessions().load("conv-1").await.unwrap().unwrap();
        assert_eq!(session.turns.len(), 2);
        assert_eq!(session.last_action.as_deref(), Some(CLARIFY_ACTION));

        // The short reply becomes a directive carrying the original request.
        let backend = ScriptedBackend::new(&["m1"])
            .with("m1", Step::call("generate_quiz", json!({"topic": "fractions", "question_count": 3})))
            .with("m1", Step::submit("artifact_ready", "Quiz ready."));
        let h2 = Harness {
            dispatcher: Arc::new(Dispatcher::new(
                Services {
                    classifier: Arc::new(FixedClassifier::new("quiz_generate", 0.9)),
                    orchestrator: ToolOrchestrator::new(
                        Arc::new(backend),
                        h.dispatcher.services.orchestrator.tools().clone(),
                        OrchestratorConfig::default(),
                    ),
                    ..h.dispatcher.services.clone()
                },
                DispatchSettings::default(),
            )),
            backend: h.backend.clone(),
        };
        let (result, _) = run_collecting(&h2.dispatcher, request("conv-1", "grade 5, fractions")).await;
        let summary = result.unwrap();
        assert_eq!(summary.mode, TurnMode::Build);
        assert_eq!(summary.artifact_ids.len(), 1);

        let session = h2.dispatcher.sessions().load("conv-1").await.unwrap().unwrap();
        assert_eq!(session.turns.len(), 4);
        assert_eq!(session.turns[2].content, "grade 5, fractions");
        assert_eq!(session.last_artifact_ids(), summary.artifact_ids);
    }

    #[tokio::test]
    async fn test_continuation_directive_reaches_the_model() {
        let backend = ScriptedBackend::new(&["m1"])
            .with("m1", Step::call("generate_quiz", json!({"topic": "fractions"})))
            .with("m1", Step::submit("artifact_ready", "Done."));
        let h = harness(FixedClassifier::new("quiz_generate", 0.9), backend, None);
        let mut session = ConversationSession::new("conv-1");
        session.append(Turn::user("make a quiz"));
        session.append(Turn::assistant("Which grade?", CLARIFY_ACTION));
        h.dispatcher.sessions().save(&session).await.unwrap();

        let (result, _) = run_collecting(&h.dispatcher, request("conv-1", "grade 5")).await;
        result.unwrap();

        let (_, messages) = &h.backend.requests()[0];
        let directive = messages
            .iter()
            .filter_map(|m| m.content.as_deref())
            .find(|c| c.contains("Original request: make a quiz"))
            .expect("directive sent");
        assert!(directive.contains("Clarifying question: Which grade?"));
        assert!(directive.contains("User's answer: grade 5"));
        assert!(directive.contains("Act now"));
    }

    #[tokio::test]
    async fn test_agent_build_records_artifacts_and_tool_summary() {
        let backend = ScriptedBackend::new(&["m1"])
            .with("m1", Step::call("generate_quiz", json!({"topic": "fractions", "question_count": 3})))
            .with("m1", Step::submit("artifact_ready", "Your quiz is ready."));
        let h = harness(FixedClassifier::new("quiz_generate", 0.9), backend, None);
        let (result, events) = run_collecting(&h.dispatcher, request("conv-1", "Make a 3 question fractions quiz")).await;
        let summary = result.unwrap();

        assert_eq!(summary.mode, TurnMode::Build);
        assert_eq!(summary.action, "build");
        assert_eq!(summary.model.as_deref(), Some("m1"));
        assert_eq!(summary.response, "Your quiz is ready.");
        let names = data_names(&events);
        assert!(names.contains(&"action"));
        assert!(names.contains(&"artifact"));
        assert!(events.contains(&TurnEvent::Text("Your quiz is ready.".into())));

        let artifact = h.dispatcher.artifacts().get(&summary.artifact_ids[0]).await.unwrap();
        assert_eq!(artifact.version, 1);

        let session = h.dispatcher.sessions().load("conv-1").await.unwrap().unwrap();
        let last = session.turns.last().unwrap();
        assert_eq!(last.action.as_deref(), Some("build"));
        assert_eq!(last.tool_summary.as_deref(), Some("generate_quiz"));
        assert_eq!(session.last_intent.as_deref(), Some("quiz_generate"));
    }

    #[tokio::test]
    async fn test_plain_text_agent_answer_is_not_repeated() {
        let backend = ScriptedBackend::new(&["m1"]).with("m1", Step::text("Fractions are parts of a whole."));
        let h = harness(FixedClassifier::new("data_analyze", 0.9), backend, None);
        let (result, events) = run_collecting(&h.dispatcher, request("conv-1", "analyze this")).await;
        let summary = result.unwrap();
        assert_eq!(summary.action, "answer");
        let texts = events.iter().filter(|e| matches!(e, TurnEvent::Text(_))).count();
        assert_eq!(texts, 1);
    }

    fn roster() -> Roster {
        Roster {
            classes: vec![ClassRecord {
                id: "c1".into(),
                name: "Form 1A".into(),
                students: vec![StudentRecord {
                    id: "s1".into(),
                    name: "张三".into(),
                    aliases: vec![],
                }],
                ..Default::default()
            }],
        }
    }

    #[tokio::test]
    async fn test_student_without_class_asks_for_the_class() {
        let h = harness(FixedClassifier::new("data_analyze", 0.9), ScriptedBackend::new(&["m1"]), None);
        let mut req = request("conv-1", "请帮我看看张三同学的作业");
        req.roster = Some(roster());
        let (result, events) = run_collecting(&h.dispatcher, req).await;
        let summary = result.unwrap();

        assert_eq!(summary.mode, TurnMode::Clarify);
        assert_eq!(summary.response, "请问是哪个班级？");
        assert_eq!(summary.entities.unwrap().missing_context, vec![MISSING_CLASS]);
        assert_eq!(data_names(&events), vec!["entities", "clarify"]);
        assert!(h.backend.requests().is_empty());
    }

    #[tokio::test]
    async fn test_context_class_lets_student_resolve() {
        let backend = ScriptedBackend::new(&["m1"])
            .with("m1", Step::call("get_context_entities", json!({})))
            .with("m1", Step::call("analyze_data", json!({"question": "homework"})))
            .with("m1", Step::submit("artifact_ready", "Analysis ready."));
        let h = harness(FixedClassifier::new("data_analyze", 0.9), backend, None);
        let mut req = request("conv-1", "请帮我看看张三同学的作业");
        req.roster = Some(roster());
        req.context.insert(CLASS_ID_KEY.into(), json!("c1"));
        let (result, _) = run_collecting(&h.dispatcher, req).await;
        let summary = result.unwrap();

        assert_eq!(summary.mode, TurnMode::Build);
        assert_eq!(summary.entities.unwrap().ids(), vec!["s1"]);
    }

    #[tokio::test]
    async fn test_pipeline_strategy_runs_the_page_pipeline() {
        let pipeline = ScriptedPipeline {
            plan: PagePlan {
                title: "Fractions".into(),
                summary: "An intro page".into(),
                sections: vec![json!({"id": "intro"})],
            },
            events: vec![
                PipelineEvent::Phase {
                    phase: "data".into(),
                    message: None,
                },
                PipelineEvent::ToolCall {
                    call_id: "p1".into(),
                    tool: "fetch_scores".into(),
                    input: json!({}),
                },
                PipelineEvent::ToolResult {
                    call_id: "p1".into(),
                    output: json!({"rows": 3}),
                },
                PipelineEvent::BlockDelta {
                    block_id: "intro".into(),
                    delta: "Fractions are".into(),
                },
                PipelineEvent::Complete {
                    content: json!({"blocks": [{"id": "intro", "text": "Fractions are"}]}),
                },
            ],
        };
        let h = harness(
            FixedClassifier::new("page_build", 0.9).with_strategy("pipeline"),
            ScriptedBackend::new(&["m1"]),
            Some(pipeline),
        );
        let (result, events) = run_collecting(&h.dispatcher, request("conv-1", "Build a fractions page")).await;
        let summary = result.unwrap();

        assert_eq!(summary.mode, TurnMode::Build);
        assert_eq!(summary.model.as_deref(), Some("scripted-planner"));
        assert_eq!(summary.response, "Your page \"Fractions\" is ready.");
        assert_eq!(
            data_names(&events),
            vec!["action", "page-plan", "phase", "block-delta", "artifact"]
        );
        assert!(events.iter().any(|e| matches!(e, TurnEvent::ToolOutput { call_id, .. } if call_id == "p1")));

        let artifact = h.dispatcher.artifacts().get(&summary.artifact_ids[0]).await.unwrap();
        assert_eq!(artifact.artifact_type, "page");
        assert!(h.backend.requests().is_empty());
    }

    #[tokio::test]
    async fn test_pipeline_without_page_is_an_error() {
        let pipeline = ScriptedPipeline {
            plan: PagePlan::default(),
            events: vec![PipelineEvent::Error {
                message: "renderer offline".into(),
            }],
        };
        let h = harness(
            FixedClassifier::new("page_build", 0.9).with_strategy("pipeline"),
            ScriptedBackend::new(&["m1"]),
            Some(pipeline),
        );
        let (result, events) = run_collecting(&h.dispatcher, request("conv-1", "Build a page")).await;
        assert!(matches!(result, Err(AgentError::CollaboratorError { .. })));
        assert!(events.contains(&TurnEvent::Error("renderer offline".into())));

        let session = h.dispatcher.sessions().load("conv-1").await.unwrap().unwrap();
        assert_eq!(session.turns.last().unwrap().action.as_deref(), Some("error"));
    }

    #[tokio::test]
    async fn test_pipeline_strategy_without_pipeline_uses_agent() {
        let backend = ScriptedBackend::new(&["m1"])
            .with("m1", Step::call("generate_content", json!({"topic": "fractions"})))
            .with("m1", Step::submit("artifact_ready", "Done."));
        let h = harness(FixedClassifier::new("page_build", 0.9).with_strategy("pipeline"), backend, None);
        let (result, _) = run_collecting(&h.dispatcher, request("conv-1", "Build a page")).await;
        assert_eq!(result.unwrap().model.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected() {
        let h = harness(FixedClassifier::new("chat_qa", 0.9), ScriptedBackend::new(&["m1"]), None);
        let (result, events) = run_collecting(&h.dispatcher, request("conv-1", "   ")).await;
        assert!(matches!(result, Err(AgentError::InvalidRequest { .. })));
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_missing_conversation_id_starts_a_new_session() {
        let h = harness(FixedClassifier::new("chat_qa", 0.9), ScriptedBackend::new(&["m1"]), None);
        let req = ChatRequest {
            message: "hello".into(),
            ..Default::default()
        };
        let (result, _) = run_collecting(&h.dispatcher, req).await;
        let summary = result.unwrap();
        assert!(!summary.conversation_id.is_empty());
        let session = h.dispatcher.sessions().load(&summary.conversation_id).await.unwrap().unwrap();
        assert_eq!(session.turns.len(), 2);
    }

    #[test]
    fn test_summary_serializes_camel_case() {
        let mut summary = TurnSummary::new("c1", TurnMode::Chat, "chat", "hi");
        summary.chat_kind = Some("qa".into());
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["conversationId"], "c1");
        assert_eq!(value["mode"], "chat");
        assert_eq!(value["chatKind"], "qa");
        assert_eq!(value["artifactIds"], json!([]));
        assert!(value.get("toolSummary").is_none());
        assert!(value.get("warnings").is_none());
    }
}
