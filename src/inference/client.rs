//! OpenAI-compatible inference client.
//!
//! Sends chat completion requests to any configured model endpoint and streams
//! back tokens and tool calls. Model selection is per call: the orchestrator
//! owns the fallback walk for tool-calling turns, while the LLM-backed
//! collaborators use [`GenerationBackend::complete_with_fallback`].

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client as HttpClient;

use super::backend::{ChunkStream, GenerationBackend};
use super::config::{ModelConfig, ModelsConfig};
use super::errors::InferenceError;
use super::streaming::{parse_non_streaming_response, parse_sse_stream};
use super::tool_call_parser::{extract_tool_call_from_error, parse_native_json_tool_call};
use super::types::{ChatCompletionRequest, ChatMessage, ResponseFormat, StreamChunk, ToolDefinition};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total request timeout for non-streaming calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Total request timeout for streaming calls.
///
/// Long multi-tool turns with a large history can take minutes to finish;
/// a short timeout silently truncates the stream.
const STREAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

// ─── InferenceClient ─────────────────────────────────────────────────────────

/// Client for OpenAI-compatible chat completion endpoints.
pub struct InferenceClient {
    /// HTTP client for non-streaming requests.
    http: HttpClient,
    /// HTTP client for streaming requests.
    http_stream: HttpClient,
    /// The model registry.
    config: ModelsConfig,
}

impl InferenceClient {
    /// Create a new inference client from the model registry.
    ///
    /// Does NOT check connectivity; that happens on the first request.
    pub fn from_config(config: ModelsConfig) -> Result<Self, InferenceError> {
        let http = build_http_client(REQUEST_TIMEOUT)?;
        let http_stream = build_http_client(STREAM_REQUEST_TIMEOUT)?;
        Ok(Self {
            http,
            http_stream,
            config,
        })
    }

    /// The model registry this client dispatches against.
    pub fn config(&self) -> &ModelsConfig {
        &self.config
    }

    // ─── Chat Completion (streaming) ─────────────────────────────────────

    async fn try_stream_request(
        &self,
        model_key: &str,
        model: &ModelConfig,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<ChunkStream, InferenceError> {
        let url = format!("{}/chat/completions", model.base_url);
        let body = build_request(model_key, model, messages, tools, true);

        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            tool_count = body.tools.as_ref().map(|t| t.len()).unwrap_or(0),
            max_tokens = body.max_tokens,
            "=== LLM REQUEST ==="
        );

        let mut request = self
            .http_stream
            .post(&url)
            .json(&body)
            .header("Accept", "text/event-stream");
        if let Some(key) = model.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_send_error(e, &url, STREAM_REQUEST_TIMEOUT))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        Ok(parse_sse_stream(response, model.tool_call_format).boxed())
    }

    // ─── Chat Completion (non-streaming) ─────────────────────────────────

    async fn try_complete(
        &self,
        model_key: &str,
        model: &ModelConfig,
        messages: &[ChatMessage],
    ) -> Result<StreamChunk, InferenceError> {
        let url = format!("{}/chat/completions", model.base_url);
        let body = build_request(model_key, model, messages, None, false);

        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = model.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_send_error(e, &url, REQUEST_TIMEOUT))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let body_text = response.text().await.map_err(|e| InferenceError::StreamError {
            reason: format!("failed to read response body: {e}"),
        })?;

        parse_non_streaming_response(&body_text, model.tool_call_format)
    }

    // ─── Health Check ────────────────────────────────────────────────────

    /// Check whether the primary model endpoint is reachable.
    pub async fn health_check(&self) -> bool {
        let Some(key) = self.config.ordered_chain().into_iter().next() else {
            return false;
        };
        let Ok(model) = self.config.model(&key) else {
            return false;
        };
        let url = format!("{}/models", model.base_url);
        match self.http.get(&url).timeout(CONNECT_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl GenerationBackend for InferenceClient {
    async fn stream_chat(
        &self,
        model_key: &str,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<ChunkStream, InferenceError> {
        let model = self.config.model(model_key)?;
        match self.try_stream_request(model_key, model, messages, tools).await {
            Err(e) if e.is_tool_call_parse_error() => {
                // The runtime rejected the model's own tool-call JSON. Recover
                // it client-side when the arguments are salvageable, otherwise
                // hand the raw text up for a repair pass.
                match repair_from_error(&e) {
                    Some(chunk) => {
                        tracing::info!(model = %model_key, "repaired malformed tool call from runtime error");
                        Ok(futures::stream::once(async { Ok(chunk) }).boxed())
                    }
                    None => Err(InferenceError::ToolCallParseError {
                        raw_response: e.error_body().unwrap_or_default().to_string(),
                        reason: "runtime could not parse tool call".into(),
                    }),
                }
            }
            other => other,
        }
    }

    async fn complete(
        &self,
        model_key: &str,
        messages: &[ChatMessage],
    ) -> Result<StreamChunk, InferenceError> {
        let model = self.config.model(model_key)?;
        self.try_complete(model_key, model, messages).await
    }

    fn model_chain(&self) -> Vec<String> {
        self.config.ordered_chain()
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn build_http_client(timeout: Duration) -> Result<HttpClient, InferenceError> {
    HttpClient::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(timeout)
        .build()
        .map_err(|e| InferenceError::ConfigError {
            reason: format!("failed to build HTTP client: {e}"),
        })
}

fn build_request(
    model_key: &str,
    model: &ModelConfig,
    messages: &[ChatMessage],
    tools: Option<&[ToolDefinition]>,
    stream: bool,
) -> ChatCompletionRequest {
    let tools = tools.filter(|t| !t.is_empty()).map(<[ToolDefinition]>::to_vec);
    let response_format = (model.force_json_response && tools.is_some()).then(|| ResponseFormat {
        r#type: "json_object".to_string(),
    });

    ChatCompletionRequest {
        model: model.model_name.clone().unwrap_or_else(|| model_key.to_string()),
        messages: messages.to_vec(),
        tool_choice: tools.as_ref().map(|_| "auto".to_string()),
        tools,
        temperature: model.temperature,
        max_tokens: model.max_tokens,
        stream,
        response_format,
    }
}

fn map_send_error(e: reqwest::Error, url: &str, timeout: Duration) -> InferenceError {
    if e.is_timeout() {
        InferenceError::Timeout {
            duration_secs: timeout.as_secs(),
        }
    } else {
        InferenceError::ConnectionFailed {
            endpoint: url.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Build a synthetic tool-call chunk from a runtime's parse-error body.
///
/// The runtime's error body carries only the arguments, so this is limited to
/// the terminal `submit_result` call, whose arguments are self-identifying.
fn repair_from_error(err: &InferenceError) -> Option<StreamChunk> {
    let raw = extract_tool_call_from_error(err.error_body()?)?;
    let repaired = super::tool_call_parser::repair_malformed_tool_call_json(&raw)?;
    if repaired.get("status").is_none() {
        return None;
    }
    let call = parse_native_json_tool_call(None, "submit_result", &repaired.to_string()).ok()?;
    Some(StreamChunk::calls(vec![call]))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
