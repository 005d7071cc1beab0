//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility. These types carry the context needed to build
//! meaningful log entries and to decide whether a failure is worth a fallback.

use thiserror::Error;

/// Message fragments that mark a stream-level failure as the provider's fault.
const PROVIDER_MESSAGE_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "overloaded",
    "quota",
    "unavailable",
    "connection reset",
    "connection closed",
    "timed out",
];

/// Errors that can occur during inference operations.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the model endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed {
        endpoint: String,
        reason: String,
    },

    /// The model endpoint did not respond within the configured timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout {
        duration_secs: u64,
    },

    /// The model produced structured output (tool-call arguments) that is not valid JSON.
    #[error("tool call parse error: {reason}")]
    ToolCallParseError {
        raw_response: String,
        reason: String,
    },

    /// The requested model key is not present in the model registry.
    #[error("unknown model: {key}")]
    UnknownModel {
        key: String,
    },

    /// Every model in the fallback chain was unavailable.
    #[error("all models unavailable (tried: {})", attempted.join(", "))]
    AllModelsUnavailable {
        attempted: Vec<String>,
    },

    /// Non-2xx HTTP response from the model endpoint.
    #[error("HTTP {status}: {body}")]
    HttpError {
        status: u16,
        body: String,
    },

    /// SSE stream parsing or chunk-level error.
    #[error("stream error: {reason}")]
    StreamError {
        reason: String,
    },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl InferenceError {
    /// Check if this error is a runtime-side tool call parse failure (HTTP 500).
    ///
    /// OpenAI-compatible local runtimes return HTTP 500 with
    /// `"error parsing tool call"` when the model emits malformed JSON in tool
    /// call arguments.
    pub fn is_tool_call_parse_error(&self) -> bool {
        matches!(
            self,
            InferenceError::HttpError { status: 500, body }
                if body.contains("error parsing tool call")
        )
    }

    /// Whether the failure is malformed structured output from the model.
    ///
    /// These get one repair pass before the fallback chain advances.
    pub fn is_malformed_output(&self) -> bool {
        matches!(self, InferenceError::ToolCallParseError { .. }) || self.is_tool_call_parse_error()
    }

    /// Whether the failure is attributable to the provider or its transport.
    ///
    /// Provider errors advance the model fallback chain. Everything else is an
    /// application error and propagates immediately.
    pub fn is_provider_error(&self) -> bool {
        match self {
            InferenceError::ConnectionFailed { .. }
            | InferenceError::Timeout { .. }
            | InferenceError::AllModelsUnavailable { .. } => true,
            InferenceError::HttpError { status, body } => {
                matches!(status, 401 | 403 | 404 | 408 | 429 | 500..=599)
                    || matches_provider_pattern(body)
            }
            InferenceError::StreamError { reason } => matches_provider_pattern(reason),
            InferenceError::ToolCallParseError { .. }
            | InferenceError::UnknownModel { .. }
            | InferenceError::ConfigError { .. } => false,
        }
    }

    /// Extract the error body text, if this is an `HttpError`.
    pub fn error_body(&self) -> Option<&str> {
        match self {
            InferenceError::HttpError { body, .. } => Some(body),
            _ => None,
        }
    }

    /// The raw model output that failed to parse, if any.
    pub fn raw_output(&self) -> Option<&str> {
        match self {
            InferenceError::ToolCallParseError { raw_response, .. } => Some(raw_response),
            InferenceError::HttpError { body, .. } if self.is_tool_call_parse_error() => Some(body),
            _ => None,
        }
    }
}

fn matches_provider_pattern(text: &str) -> bool {
    let lower = text.to_lowercase();
    PROVIDER_MESSAGE_PATTERNS.iter().any(|p| lower.contains(p))
}
