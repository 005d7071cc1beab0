//! Gateway configuration loading and validation.
//!
//! Reads `config/gateway.yaml` and resolves environment variables. The file is
//! the single source of truth for model endpoints, routing thresholds, retry
//! budgets, and stream settings. Every section has defaults so a partial file
//! (or none at all) still yields a runnable gateway.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::inference::config::ModelsConfig;
use crate::inference::errors::InferenceError;

/// Relative location of the config file inside a project tree.
const CONFIG_RELATIVE_PATH: &str = "config/gateway.yaml";

/// Env var holding an explicit config file path.
const CONFIG_ENV_VAR: &str = "CLASSROOM_GATEWAY_CONFIG";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Confidence bands for the Confidence Router.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RouterThresholds {
    /// At or above this, a build-capable intent builds.
    pub build_threshold: f64,
    /// Below this, a build-capable intent falls back to chat.
    pub clarify_threshold: f64,
}

impl Default for RouterThresholds {
    fn default() -> Self {
        Self {
            build_threshold: 0.7,
            clarify_threshold: 0.4,
        }
    }
}

/// Entity resolver settings.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Minimum normalized similarity for a fuzzy match.
    pub fuzzy_threshold: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self { fuzzy_threshold: 0.6 }
    }
}

/// Tool-calling orchestrator budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum generate→tool→generate rounds per model attempt.
    pub max_tool_rounds: u32,
    /// Terminal-state validation retries (hard and soft share this budget).
    pub validation_retries: u32,
    /// Re-prompt repair passes for malformed structured output, per turn.
    pub repair_attempts: u32,
    /// Accept a soft-failing result with a warning once retries run out.
    pub accept_soft_failure: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 8,
            validation_retries: 1,
            repair_attempts: 1,
            accept_soft_failure: true,
        }
    }
}

/// Which backend holds sessions and artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Memory,
    Sqlite,
}

/// Conversation session settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Trailing window of turns handed to the classifier and the backend.
    pub max_turns: usize,
    /// Replies longer than this are never treated as clarification answers.
    pub continuation_max_chars: usize,
    pub store: StoreKind,
    /// SQLite file. Defaults to `<data_dir>/gateway.db`.
    pub database_path: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_turns: 10,
            continuation_max_chars: 200,
            store: StoreKind::Memory,
            database_path: None,
        }
    }
}

/// Streaming transport settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Silence interval after which a heartbeat comment is written.
    pub heartbeat_secs: u64,
    /// Capacity of the per-turn merge queue.
    pub queue_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 15,
            queue_capacity: 256,
        }
    }
}

impl StreamConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".into(),
        }
    }
}

/// Top-level gateway configuration (mirrors `config/gateway.yaml`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub models: ModelsConfig,
    pub router: RouterThresholds,
    pub resolver: ResolverConfig,
    pub orchestrator: OrchestratorConfig,
    pub session: SessionConfig,
    pub stream: StreamConfig,
    pub server: ServerConfig,
}

impl GatewayConfig {
    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), InferenceError> {
        let RouterThresholds {
            build_threshold,
            clarify_threshold,
        } = self.router;
        if !(0.0..=1.0).contains(&clarify_threshold)
            || !(0.0..=1.0).contains(&build_threshold)
            || clarify_threshold > build_threshold
        {
            return Err(InferenceError::ConfigError {
                reason: format!(
                    "router thresholds must satisfy 0 <= clarify ({clarify_threshold}) <= build ({build_threshold}) <= 1"
                ),
            });
        }
        let fuzzy = self.resolver.fuzzy_threshold;
        if !(fuzzy > 0.0 && fuzzy <= 1.0) {
            return Err(InferenceError::ConfigError {
                reason: format!("resolver.fuzzy_threshold must be in (0, 1], got {fuzzy}"),
            });
        }
        if self.stream.queue_capacity == 0 {
            return Err(InferenceError::ConfigError {
                reason: "stream.queue_capacity must be at least 1".into(),
            });
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// `CLASSROOM_GATEWAY_CONFIG` wins when it points at an existing file;
/// otherwise searches upward from `start` for `config/gateway.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, InferenceError> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&explicit));
        if candidate.is_file() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} does not point at a file");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_RELATIVE_PATH);
        if candidate.is_file() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(InferenceError::ConfigError {
        reason: format!("could not find {CONFIG_RELATIVE_PATH}"),
    })
}

/// Load, interpolate, parse, and validate the gateway config file.
pub fn load_gateway_config(path: &Path) -> Result<GatewayConfig, InferenceError> {
    let raw = std::fs::read_to_string(path).map_err(|e| InferenceError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_gateway_config(&raw)
}

/// Parse config text (after `${VAR}` interpolation) and validate it.
pub fn parse_gateway_config(raw: &str) -> Result<GatewayConfig, InferenceError> {
    let interpolated = interpolate_env_vars(raw);
    let config: GatewayConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| InferenceError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;
    config.validate()?;
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let var_expr: String = chars.by_ref().take_while(|&c| c != '}').collect();
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
