//! Tool registry: the built-in tool catalogue and name resolution.
//!
//! Provides:
//! - Tool lookup by name
//! - Capability-group filtering for the toolset gate
//! - Correction of hallucinated tool names via edit distance
//! - Serialization of tools into OpenAI function-calling format

use std::collections::{BTreeMap, BTreeSet};

use serde_json::json;

use crate::agent_core::toolset::CapabilityGroup;
use crate::inference::types::{FunctionDefinition, ToolDefinition};

/// Name of the terminal tool. Handled by the orchestrator, never executed.
pub const SUBMIT_RESULT: &str = "submit_result";

/// Minimum similarity for correcting a hallucinated tool name.
pub const MIN_CORRECTION_SIMILARITY: f64 = 0.8;

// ─── ToolSpec ───────────────────────────────────────────────────────────────

/// One catalogue entry.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments.
    pub parameters: serde_json::Value,
    /// Every group that exposes this tool.
    pub groups: Vec<CapabilityGroup>,
    /// Whether a successful call yields a (new version of an) artifact.
    pub produces_artifact: bool,
}

impl ToolSpec {
    fn new(
        name: &str,
        description: &str,
        parameters: serde_json::Value,
        groups: &[CapabilityGroup],
        produces_artifact: bool,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            groups: groups.to_vec(),
            produces_artifact,
        }
    }

    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            r#type: "function".into(),
            function: FunctionDefinition {
                name: self.name.clone(),
                description: self.description.clone(),
                parameters: self.parameters.clone(),
            },
        }
    }
}

// ─── ToolRegistry ───────────────────────────────────────────────────────────

/// Catalogue of callable tools, keyed by name.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, ToolSpec>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// The built-in classroom tool catalogue.
    pub fn builtin() -> Self {
        use CapabilityGroup::*;

        let mut registry = Self::new();
        registry.register(ToolSpec::new(
            SUBMIT_RESULT,
            "Finish the turn. Call exactly once with the final outcome.",
            json!({
                "type": "object",
                "properties": {
                    "status": {
                        "type": "string",
                        "enum": ["answer_ready", "artifact_ready", "clarify_needed"]
                    },
                    "message": {"type": "string"},
                    "artifact_ids": {"type": "array", "items": {"type": "string"}},
                    "clarify": {
                        "type": "object",
                        "properties": {
                            "question": {"type": "string"},
                            "options": {"type": "array", "items": {"type": "string"}}
                        }
                    }
                },
                "required": ["status", "message"]
            }),
            &[Base],
            false,
        ));
        registry.register(ToolSpec::new(
            "get_session_context",
            "Read the accumulated context of this conversation (recent turns, known artifacts).",
            json!({"type": "object", "properties": {}}),
            &[Base],
            false,
        ));
        registry.register(ToolSpec::new(
            "generate_quiz",
            "Generate a quiz and store it as a new artifact.",
            json!({
                "type": "object",
                "properties": {
                    "topic": {"type": "string"},
                    "grade": {"type": "string"},
                    "question_count": {"type": "integer", "minimum": 1},
                    "question_types": {"type": "array", "items": {"type": "string"}},
                    "difficulty": {"type": "string"}
                },
                "required": ["topic"]
            }),
            &[Generate],
            true,
        ));
        registry.register(ToolSpec::new(
            "generate_content",
            "Generate teaching content (lesson plan, worksheet, handout, slides outline) as a new artifact.",
            json!({
                "type": "object",
                "properties": {
                    "kind": {"type": "string"},
                    "topic": {"type": "string"},
                    "grade": {"type": "string"},
                    "requirements": {"type": "string"}
                },
                "required": ["topic"]
            }),
            &[Generate],
            true,
        ));
        registry.register(ToolSpec::new(
            "analyze_data",
            "Analyze class or student data (scores, trends, comparisons) and store the report as an artifact.",
            json!({
                "type": "object",
                "properties": {
                    "question": {"type": "string"},
                    "entity_ids": {"type": "array", "items": {"type": "string"}},
                    "data": {}
                },
                "required": ["question"]
            }),
            &[Analyze],
            true,
        ));
        registry.register(ToolSpec::new(
            "get_artifact",
            "Read the latest version of an artifact.",
            json!({
                "type": "object",
                "properties": {"artifact_id": {"type": "string"}},
                "required": ["artifact_id"]
            }),
            &[Modify, Artifact],
            false,
        ));
        registry.register(ToolSpec::new(
            "patch_artifact",
            "Apply a change to an existing artifact, producing its next version.",
            json!({
                "type": "object",
                "properties": {
                    "artifact_id": {"type": "string"},
                    "instruction": {"type": "string"},
                    "scope": {"type": "string", "enum": ["block", "section", "page"]}
                },
                "required": ["artifact_id", "instruction"]
            }),
            &[Modify, Artifact],
            true,
        ));
        registry.register(ToolSpec::new(
            "get_context_entities",
            "List the classes, students, and assignments resolved for this turn.",
            json!({"type": "object", "properties": {}}),
            &[Context],
            false,
        ));
        registry
    }

    pub fn register(&mut self, spec: ToolSpec) {
        self.tools.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    /// Whether a tool yields an artifact. Unknown tools do not.
    pub fn produces_artifact(&self, name: &str) -> bool {
        self.tools.get(name).is_some_and(|t| t.produces_artifact)
    }

    /// Names of the tools exposed by any of `groups`, in name order.
    pub fn names_for(&self, groups: &BTreeSet<CapabilityGroup>) -> Vec<String> {
        self.tools
            .values()
            .filter(|t| t.groups.iter().any(|g| groups.contains(g)))
            .map(|t| t.name.clone())
            .collect()
    }

    /// OpenAI tool definitions for the tools exposed by any of `groups`.
    pub fn definitions_for(&self, groups: &BTreeSet<CapabilityGroup>) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .filter(|t| t.groups.iter().any(|g| groups.contains(g)))
            .map(ToolSpec::to_definition)
            .collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Name Resolution ────────────────────────────────────────────────────────

/// Result of resolving a model-emitted tool name.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResolution {
    /// The name exists as-is.
    Exact(String),
    /// The name was close enough to a registered tool to correct.
    Corrected {
        resolved: String,
        original: String,
        score: f64,
    },
    /// Nothing close enough; `suggestions` are the nearest names.
    NotFound {
        original: String,
        suggestions: Vec<String>,
    },
}

impl ToolResolution {
    /// The resolved tool name, if resolution succeeded.
    pub fn resolved_name(&self) -> Option<&str> {
        match self {
            Self::Exact(name) => Some(name),
            Self::Corrected { resolved, .. } => Some(resolved),
            Self::NotFound { .. } => None,
        }
    }
}

impl ToolRegistry {
    /// Resolve a tool name that may be wrong or hallucinated.
    ///
    /// Strategy (first match wins):
    /// 1. **Exact:** name exists in the registry as-is.
    /// 2. **Normalized:** a server-style prefix (`builtin.generate_quiz`) or
    ///    case/hyphen differences are stripped, then looked up again.
    /// 3. **Fuzzy:** the most similar registered name at or above
    ///    `min_similarity` (0.0–1.0).
    /// 4. **NotFound:** with up to three suggestions.
    pub fn resolve(&self, name: &str, min_similarity: f64) -> ToolResolution {
        if self.tools.contains_key(name) {
            return ToolResolution::Exact(name.to_string());
        }

        let normalized = normalize_tool_name(name);
        if self.tools.contains_key(&normalized) {
            return ToolResolution::Corrected {
                resolved: normalized,
                original: name.to_string(),
                score: 1.0,
            };
        }

        let mut best: Option<(&str, f64)> = None;
        for candidate in self.tools.keys() {
            let score = similarity(&normalized, candidate);
            if score >= min_similarity && best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((candidate, score));
            }
        }

        if let Some((resolved, score)) = best {
            return ToolResolution::Corrected {
                resolved: resolved.to_string(),
                original: name.to_string(),
                score,
            };
        }

        ToolResolution::NotFound {
            original: name.to_string(),
            suggestions: self.find_similar(&normalized, 3),
        }
    }

    /// Up to `max_results` registered names most similar to `name`.
    pub fn find_similar(&self, name: &str, max_results: usize) -> Vec<String> {
        let mut scored: Vec<(String, f64)> = self
            .tools
            .keys()
            .map(|candidate| (candidate.clone(), similarity(name, candidate)))
            .filter(|(_, score)| *score > 0.3)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_results);
        scored.into_iter().map(|(name, _)| name).collect()
    }
}

fn normalize_tool_name(name: &str) -> String {
    name.rsplit('.')
        .next()
        .unwrap_or(name)
        .trim()
        .to_lowercase()
        .replace('-', "_")
}

// ─── Edit Distance ──────────────────────────────────────────────────────────

/// Levenshtein edit distance, counted in chars rather than bytes so CJK
/// names compare sensibly.
pub(crate) fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let n = b.len();

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=n {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1) // deletion
                .min(curr[j - 1] + 1) // insertion
                .min(prev[j - 1] + cost); // substitution
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// Normalized similarity (0.0 = completely different, 1.0 = identical).
pub(crate) fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn groups(gs: &[CapabilityGroup]) -> BTreeSet<CapabilityGroup> {
        gs.iter().copied().collect()
    }

    #[test]
    fn test_levenshtein_counts_chars() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("张三", "张三丰"), 1);
    }

    #[test]
    fn test_similarity_bounds() {
        assert_eq!(similarity("", ""), 1.0);
        assert_eq!(similarity("abc", "abc"), 1.0);
        assert!(similarity("abc", "xyz") < 0.01);
    }

    #[test]
    fn test_resolve_exact() {
        let registry = ToolRegistry::builtin();
        assert_eq!(
            registry.resolve("generate_quiz", MIN_CORRECTION_SIMILARITY),
            ToolResolution::Exact("generate_quiz".into())
        );
    }

    #[test]
    fn test_resolve_prefixed_name() {
        let registry = ToolRegistry::builtin();
        let resolution = registry.resolve("builtin.Generate-Quiz", MIN_CORRECTION_SIMILARITY);
        assert_eq!(resolution.resolved_name(), Some("generate_quiz"));
    }

    #[test]
    fn test_resolve_typo_corrected() {
        let registry = ToolRegistry::builtin();
        match registry.resolve("generate_quizz", MIN_CORRECTION_SIMILARITY) {
            ToolResolution::Corrected { resolved, score, .. } => {
                assert_eq!(resolved, "generate_quiz");
                assert!(score >= MIN_CORRECTION_SIMILARITY);
            }
            other => panic!("expected correction, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_hallucinated_not_found() {
        let registry = ToolRegistry::builtin();
        let resolution = registry.resolve("send_email", MIN_CORRECTION_SIMILARITY);
        assert!(resolution.resolved_name().is_none());
    }

    #[test]
    fn test_definitions_for_groups() {
        let registry = ToolRegistry::builtin();
        let names = registry.names_for(&groups(&[CapabilityGroup::Base]));
        assert_eq!(names, vec!["get_session_context", SUBMIT_RESULT]);

        let names = registry.names_for(&groups(&[CapabilityGroup::Base, CapabilityGroup::Modify]));
        assert!(names.contains(&"patch_artifact".to_string()));
        assert!(names.contains(&"get_artifact".to_string()));
        assert!(!names.contains(&"generate_quiz".to_string()));

        let defs = registry.definitions_for(&groups(&[CapabilityGroup::Generate]));
        assert_eq!(defs.len(), 2);
        assert!(defs.iter().all(|d| d.r#type == "function"));
    }

    #[test]
    fn test_produces_artifact_flags() {
        let registry = ToolRegistry::builtin();
        assert!(registry.produces_artifact("generate_quiz"));
        assert!(registry.produces_artifact("patch_artifact"));
        assert!(!registry.produces_artifact("get_artifact"));
        assert!(!registry.produces_artifact(SUBMIT_RESULT));
        assert!(!registry.produces_artifact("nope"));
    }
}
