//! Tool execution error types.

use thiserror::Error;

use crate::agent_core::AgentError;

/// Errors raised while executing a built-in tool.
///
/// All of these are reported back to the model as a tool result so it can
/// correct itself; none aborts the turn on its own.
#[derive(Debug, Error)]
pub enum ToolError {
    /// No registered tool matches the name, even after correction.
    #[error("unknown tool '{name}'{}", suggestions_suffix(.suggestions))]
    UnknownTool {
        name: String,
        suggestions: Vec<String>,
    },

    /// The arguments do not match the tool's schema.
    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// The tool ran and failed.
    #[error("{tool} failed: {reason}")]
    ExecutionFailed { tool: String, reason: String },
}

impl ToolError {
    pub(crate) fn invalid(tool: &str, reason: impl ToString) -> Self {
        ToolError::InvalidArguments {
            tool: tool.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn failed(tool: &str, reason: impl ToString) -> Self {
        ToolError::ExecutionFailed {
            tool: tool.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Tool-result payload shown to the model.
    pub fn to_tool_result(&self) -> serde_json::Value {
        serde_json::json!({ "error": self.to_string() })
    }
}

fn suggestions_suffix(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(" (did you mean: {})", suggestions.join(", "))
    }
}

impl From<ToolError> for AgentError {
    fn from(e: ToolError) -> Self {
        AgentError::ToolExecutionError {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_tool_message_lists_suggestions() {
        let err = ToolError::UnknownTool {
            name: "gen_quiz".into(),
            suggestions: vec!["generate_quiz".into()],
        };
        assert_eq!(
            err.to_string(),
            "unknown tool 'gen_quiz' (did you mean: generate_quiz)"
        );
        assert_eq!(err.to_tool_result()["error"], err.to_string());
    }
}
