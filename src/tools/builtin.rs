//! Built-in tool executor.
//!
//! Executes the catalogue from [`ToolRegistry::builtin`] against the artifact
//! service and the content generator. `submit_result` is not executed here;
//! the orchestrator consumes it as the turn's terminal state.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use super::errors::ToolError;
use super::registry::{ToolRegistry, SUBMIT_RESULT};
use crate::agent_core::artifacts::ArtifactService;
use crate::agent_core::entity_resolver::ResolvedEntity;
use crate::agent_core::types::{Artifact, ArtifactDraft, ArtifactPatch};
use crate::collaborators::ContentGenerator;

const DEFAULT_QUESTION_COUNT: u64 = 5;
const MAX_QUESTION_COUNT: u64 = 50;
const DEFAULT_CONTENT_KIND: &str = "lesson_plan";
const REFINE_SCOPES: &[&str] = &["block", "section", "page"];

/// What a tool can see of the current turn.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub conversation_id: String,
    /// Trailing conversation window as text.
    pub history: String,
    /// Artifacts known to the conversation, oldest first.
    pub artifact_ids: Vec<String>,
    pub entities: Vec<ResolvedEntity>,
    pub context: BTreeMap<String, Value>,
}

/// Result of one successful tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    /// Sent back to the model as the tool result.
    pub value: Value,
    /// Set when the call created or patched an artifact.
    pub artifact: Option<Artifact>,
}

impl ToolOutput {
    fn plain(value: Value) -> Self {
        Self { value, artifact: None }
    }

    fn with_artifact(artifact: Artifact) -> Self {
        let value = json!({
            "artifact_id": artifact.artifact_id,
            "artifact_type": artifact.artifact_type,
            "version": artifact.version,
            "title": artifact.content.get("title").cloned().unwrap_or(Value::Null),
        });
        Self {
            value,
            artifact: Some(artifact),
        }
    }
}

pub struct BuiltinTools {
    registry: ToolRegistry,
    artifacts: Arc<ArtifactService>,
    content: Arc<dyn ContentGenerator>,
}

impl BuiltinTools {
    pub fn new(registry: ToolRegistry, artifacts: Arc<ArtifactService>, content: Arc<dyn ContentGenerator>) -> Self {
        Self {
            registry,
            artifacts,
            content,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Execute a tool by its resolved name.
    pub async fn execute(&self, name: &str, args: &Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        match name {
            SUBMIT_RESULT => Err(ToolError::invalid(name, "submit_result ends the turn and is not executed")),
            "get_session_context" => Ok(ToolOutput::plain(json!({
                "conversation_id": ctx.conversation_id,
                "history": ctx.history,
                "artifact_ids": ctx.artifact_ids,
                "context": ctx.context,
            }))),
            "generate_quiz" => self.generate_quiz(args).await,
            "generate_content" => self.generate_content(args).await,
            "analyze_data" => self.analyze_data(args, ctx).await,
            "get_artifact" => {
                let id = artifact_id_arg(name, args, ctx)?;
                let artifact = self.artifacts.get(&id).await.map_err(|e| ToolError::failed(name, e))?;
                Ok(ToolOutput::plain(json!({ "artifact": artifact })))
            }
            "patch_artifact" => self.patch_artifact(args, ctx).await,
            "get_context_entities" => Ok(ToolOutput::plain(json!({ "entities": ctx.entities }))),
            other => Err(ToolError::UnknownTool {
                name: other.to_string(),
                suggestions: self.registry.find_similar(other, 3),
            }),
        }
    }

    async fn generate_quiz(&self, args: &Value) -> Result<ToolOutput, ToolError> {
        const TOOL: &str = "generate_quiz";
        let topic = required_str(TOOL, args, "topic")?;
        let count = match args.get("question_count") {
            None | Some(Value::Null) => DEFAULT_QUESTION_COUNT,
            Some(v) => v
                .as_u64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
                .ok_or_else(|| ToolError::invalid(TOOL, "question_count must be a positive integer"))?,
        };
        if count == 0 || count > MAX_QUESTION_COUNT {
            return Err(ToolError::invalid(
                TOOL,
                format!("question_count must be between 1 and {MAX_QUESTION_COUNT}"),
            ));
        }

        let request = json!({
            "topic": topic,
            "grade": optional_str(args, "grade"),
            "question_count": count,
            "question_types": args.get("question_types").cloned().unwrap_or_else(|| json!([])),
            "difficulty": optional_str(args, "difficulty").unwrap_or("medium"),
        });
        self.create_artifact(TOOL, "quiz", &request).await
    }

    async fn generate_content(&self, args: &Value) -> Result<ToolOutput, ToolError> {
        const TOOL: &str = "generate_content";
        let topic = required_str(TOOL, args, "topic")?;
        let kind = optional_str(args, "kind").unwrap_or(DEFAULT_CONTENT_KIND);
        let request = json!({
            "topic": topic,
            "grade": optional_str(args, "grade"),
            "requirements": optional_str(args, "requirements"),
        });
        self.create_artifact(TOOL, kind, &request).await
    }

    async fn analyze_data(&self, args: &Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        const TOOL: &str = "analyze_data";
        let question = required_str(TOOL, args, "question")?;
        let entity_ids: Vec<String> = match args.get("entity_ids").and_then(Value::as_array) {
            Some(ids) => ids.iter().filter_map(|v| v.as_str().map(String::from)).collect(),
            None => ctx.entities.iter().map(|e| e.entity_id.clone()).collect(),
        };
        let request = json!({
            "question": question,
            "entity_ids": entity_ids,
            "data": args.get("data").cloned().unwrap_or(Value::Null),
        });
        self.create_artifact(TOOL, "analysis", &request).await
    }

    async fn patch_artifact(&self, args: &Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        const TOOL: &str = "patch_artifact";
        let id = artifact_id_arg(TOOL, args, ctx)?;
        let instruction = required_str(TOOL, args, "instruction")?.to_string();
        let scope = optional_str(args, "scope").map(str::to_string);
        if let Some(scope) = &scope {
            if !REFINE_SCOPES.contains(&scope.as_str()) {
                return Err(ToolError::invalid(
                    TOOL,
                    format!("scope must be one of {}", REFINE_SCOPES.join(", ")),
                ));
            }
        }

        let content = self.content.clone();
        let artifact = self
            .artifacts
            .patch_with(&id, move |current| async move {
                let next = content
                    .refine(&current.artifact_type, &current.content, &instruction, scope.as_deref())
                    .await?;
                Ok(ArtifactPatch {
                    content: next,
                    resources: None,
                })
            })
            .await
            .map_err(|e| ToolError::failed(TOOL, e))?;
        Ok(ToolOutput::with_artifact(artifact))
    }

    async fn create_artifact(&self, tool: &str, kind: &str, request: &Value) -> Result<ToolOutput, ToolError> {
        let content = self
            .content
            .generate(kind, request)
            .await
            .map_err(|e| ToolError::failed(tool, e))?;
        let content_format = if content.get("format").and_then(Value::as_str) == Some("markdown") {
            "markdown"
        } else {
            "json"
        };
        let artifact = self
            .artifacts
            .create(ArtifactDraft {
                artifact_type: kind.to_string(),
                content_format: content_format.to_string(),
                content,
                resources: Vec::new(),
            })
            .await
            .map_err(|e| ToolError::failed(tool, e))?;
        tracing::info!(tool = %tool, artifact_id = %artifact.artifact_id, "artifact created");
        Ok(ToolOutput::with_artifact(artifact))
    }
}

// ─── Argument Helpers ───────────────────────────────────────────────────────

fn required_str<'a>(tool: &str, args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    optional_str(args, key).ok_or_else(|| ToolError::invalid(tool, format!("missing required string '{key}'")))
}

fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
}

/// `artifact_id` from the arguments, else the conversation's latest artifact.
fn artifact_id_arg(tool: &str, args: &Value, ctx: &ToolContext) -> Result<String, ToolError> {
    optional_str(args, "artifact_id")
        .map(str::to_string)
        .or_else(|| ctx.artifact_ids.last().cloned())
        .ok_or_else(|| ToolError::invalid(tool, "missing 'artifact_id' and the conversation has no artifact yet"))
}
