//! Session and artifact lookups.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use super::routes::{ApiError, AppState};
use crate::agent_core::{AgentError, Artifact, ConversationSession, SessionSummary};

/// Summaries, most recently updated first.
pub async fn list_sessions(State(state): State<AppState>) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    Ok(Json(state.dispatcher.sessions().list().await?))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConversationSession>, ApiError> {
    state
        .dispatcher
        .sessions()
        .load(&id)
        .await?
        .map(Json)
        .ok_or_else(|| AgentError::SessionNotFound { session_id: id }.into())
}

pub async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    if state.dispatcher.sessions().delete(&id).await? {
        tracing::info!(session_id = %id, "session deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AgentError::SessionNotFound { session_id: id }.into())
    }
}

/// Latest version.
pub async fn get_artifact(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Artifact>, ApiError> {
    Ok(Json(state.dispatcher.artifacts().get(&id).await?))
}

/// Every version, oldest first.
pub async fn artifact_versions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Artifact>>, ApiError> {
    Ok(Json(state.dispatcher.artifacts().versions(&id).await?))
}
