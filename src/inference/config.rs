//! Model registry configuration.
//!
//! The `models` section of the gateway config. Each entry describes one
//! OpenAI-compatible endpoint; the fallback chain orders them for the
//! orchestrator and the LLM-backed collaborators.

use std::collections::HashMap;

use serde::Deserialize;

use super::errors::InferenceError;

/// Chain entry that stands for "no model, answer statically". Never dispatched.
pub const STATIC_RESPONSE_KEY: &str = "static_response";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Which tool-call format the model emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallFormat {
    /// Standard OpenAI JSON tool calls.
    #[default]
    NativeJson,
    /// Text-based `Tool: … Arguments: …` format.
    Pythonic,
}

/// A single model's runtime configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub display_name: String,
    #[serde(default = "default_runtime")]
    pub runtime: String,
    /// Name sent in the request body. Defaults to the registry key.
    #[serde(default)]
    pub model_name: Option<String>,
    pub base_url: String,
    /// Bearer token for hosted providers. Usually `${ENV_VAR}` in the file.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    #[serde(default)]
    pub tool_call_format: ToolCallFormat,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// When `true`, sends `response_format: {"type":"json_object"}` on
    /// tool-calling turns so grammar-constrained runtimes emit valid JSON.
    #[serde(default)]
    pub force_json_response: bool,
    /// Optional role hint, e.g. `"classifier"`.
    #[serde(default)]
    pub role: Option<String>,
}

fn default_runtime() -> String {
    "openai".into()
}
fn default_context_window() -> u32 {
    32_768
}
fn default_temperature() -> f32 {
    0.3
}
fn default_max_tokens() -> u32 {
    2048
}

/// Top-level model registry (the `models` section of `gateway.yaml`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelsConfig {
    #[serde(default)]
    pub active_model: String,
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
    #[serde(default)]
    pub fallback_chain: Vec<String>,
}

impl ModelsConfig {
    /// The ordered list of model keys to try: active model first, then the
    /// configured fallbacks.
    ///
    /// Keys missing from `models` and the `static_response` marker are
    /// skipped; duplicates keep their first position.
    pub fn ordered_chain(&self) -> Vec<String> {
        let mut chain: Vec<String> = Vec::new();
        let candidates = std::iter::once(&self.active_model).chain(self.fallback_chain.iter());
        for key in candidates {
            if key.is_empty() || key == STATIC_RESPONSE_KEY {
                continue;
            }
            if !self.models.contains_key(key) {
                tracing::debug!(model = %key, "fallback chain entry not in registry, skipping");
                continue;
            }
            if !chain.contains(key) {
                chain.push(key.clone());
            }
        }
        chain
    }

    /// Look up a model by key.
    pub fn model(&self, key: &str) -> Result<&ModelConfig, InferenceError> {
        self.models.get(key).ok_or_else(|| InferenceError::UnknownModel {
            key: key.to_string(),
        })
    }
}

/// Resolve the active model configuration, respecting the fallback chain.
///
/// Returns `(model_key, ModelConfig)` for the first model in the chain.
/// Connectivity is checked at request time, not here.
pub fn resolve_active_model(config: &ModelsConfig) -> Result<(String, ModelConfig), InferenceError> {
    let chain = config.ordered_chain();
    let key = chain.first().ok_or_else(|| InferenceError::ConfigError {
        reason: format!(
            "active model '{}' not found in config and no fallback available",
            config.active_model
        ),
    })?;
    let model = config.model(key)?.clone();
    Ok((key.clone(), model))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(yaml: &str) -> ModelsConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    const THREE_MODELS: &str = r#"
        active_model: m1
        models:
          m1: { display_name: "M1", base_url: "http://localhost:1/v1" }
          m2: { display_name: "M2", base_url: "http://localhost:2/v1" }
          m3: { display_name: "M3", base_url: "http://localhost:3/v1", tool_call_format: pythonic }
        fallback_chain: [m1, m2, ghost, static_response, m3, m2]
    "#;

    #[test]
    fn test_ordered_chain_dedupes_and_skips_unknown() {
        let config = registry(THREE_MODELS);
        assert_eq!(config.ordered_chain(), vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_defaults_applied() {
        let config = registry(THREE_MODELS);
        let m1 = config.model("m1").unwrap();
        assert_eq!(m1.tool_call_format, ToolCallFormat::NativeJson);
        assert_eq!(m1.max_tokens, 2048);
        assert!(!m1.force_json_response, "force_json_response should default to false");
        assert_eq!(
            config.model("m3").unwrap().tool_call_format,
            ToolCallFormat::Pythonic
        );
    }

    #[test]
    fn test_resolve_active_model_falls_through_chain() {
        let mut config = registry(THREE_MODELS);
        config.active_model = "missing".into();
        let (key, model) = resolve_active_model(&config).unwrap();
        assert_eq!(key, "m1");
        assert_eq!(model.display_name, "M1");
    }

    #[test]
    fn test_resolve_active_model_not_found() {
        let config = ModelsConfig {
            active_model: "nonexistent".into(),
            ..Default::default()
        };
        assert!(resolve_active_model(&config).is_err());
    }

    #[test]
    fn test_unknown_model_lookup() {
        let config = registry(THREE_MODELS);
        assert!(matches!(
            config.model("nope"),
            Err(InferenceError::UnknownModel { .. })
        ));
    }
}
