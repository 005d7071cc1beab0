//! Agent Core error types.

use thiserror::Error;

use crate::inference::InferenceError;

/// Errors that can occur during agent core operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Session or artifact persistence failed.
    #[error("store error: {reason}")]
    StoreError { reason: String },

    /// Session not found.
    #[error("session not found: '{session_id}'")]
    SessionNotFound { session_id: String },

    /// Artifact not found.
    #[error("artifact not found: '{artifact_id}'")]
    ArtifactNotFound { artifact_id: String },

    /// A tool call failed and the failure is not recoverable inside the loop.
    #[error("tool execution failed: {reason}")]
    ToolExecutionError { reason: String },

    /// Terminal-state validation failed and the hard-retry budget is spent.
    #[error("terminal state validation failed: {reason}")]
    ValidationFailed { reason: String },

    /// The generation backend could not produce a usable result.
    #[error("generation failed: {reason}")]
    GenerationFailed { reason: String },

    /// An external collaborator (classifier, responder, pipeline) failed.
    #[error("{collaborator} failed: {reason}")]
    CollaboratorError { collaborator: String, reason: String },

    /// The request is malformed.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Serialization error.
    #[error("serialization error: {reason}")]
    SerializationError { reason: String },
}

impl AgentError {
    pub(crate) fn collaborator(name: &str, reason: impl ToString) -> Self {
        AgentError::CollaboratorError {
            collaborator: name.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error means the addressed record does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            AgentError::SessionNotFound { .. } | AgentError::ArtifactNotFound { .. }
        )
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::StoreError {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::SerializationError {
            reason: e.to_string(),
        }
    }
}

impl From<InferenceError> for AgentError {
    fn from(e: InferenceError) -> Self {
        AgentError::GenerationFailed {
            reason: e.to_string(),
        }
    }
}
