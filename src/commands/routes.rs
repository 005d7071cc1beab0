//! HTTP surface: router, shared state, and error mapping.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::chat::{ChatRequest, Dispatcher, TurnSummary};
use super::session;
use crate::agent_core::AgentError;
use crate::protocol::{spawn_turn_stream, EventSink, StreamSettings, PROTOCOL_HEADER, PROTOCOL_VERSION};

// ─── State ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub stream: StreamSettings,
}

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// An [`AgentError`] rendered as a JSON error response.
#[derive(Debug)]
pub struct ApiError(pub AgentError);

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_not_found() {
            StatusCode::NOT_FOUND
        } else if matches!(self.0, AgentError::InvalidRequest { .. }) {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, Json(ErrorResponse { error: self.0.to_string() })).into_response()
    }
}

// ─── Router ─────────────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/chat/stream", post(chat_stream))
        .route("/api/sessions", get(session::list_sessions))
        .route(
            "/api/sessions/:id",
            get(session::get_session).delete(session::delete_session),
        )
        .route("/api/artifacts/:id", get(session::get_artifact))
        .route("/api/artifacts/:id/versions", get(session::artifact_versions))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Handlers ───────────────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Run the whole turn, then answer with its summary.
async fn chat(State(state): State<AppState>, Json(request): Json<ChatRequest>) -> Result<Json<TurnSummary>, ApiError> {
    let summary = state.dispatcher.run_turn(request, EventSink::noop()).await?;
    Ok(Json(summary))
}

/// Run the turn in the background and stream its frames.
///
/// Turn failures arrive in-stream as an error frame; the response itself is
/// always 200 once the stream starts.
async fn chat_stream(State(state): State<AppState>, Json(request): Json<ChatRequest>) -> Response {
    let message_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
    tracing::info!(message_id = %message_id, "opening turn stream");

    let dispatcher = state.dispatcher.clone();
    let frames = spawn_turn_stream(state.stream, message_id, move |sink| async move {
        dispatcher.run_turn(request, sink).await.map(|_| ())
    });

    let headers = [
        (CONTENT_TYPE, "text/event-stream"),
        (CACHE_CONTROL, "no-cache, no-transform"),
        (HeaderName::from_static("x-accel-buffering"), "no"),
        (HeaderName::from_static(PROTOCOL_HEADER), PROTOCOL_VERSION),
    ];
    (headers, Body::from_stream(frames.map(Ok::<_, Infallible>))).into_response()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
