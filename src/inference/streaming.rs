//! SSE streaming response parser for OpenAI-compatible chat completions.
//!
//! Reads the response body as a byte stream, splits on SSE boundaries
//! (`data: …\n\n`), parses each chunk as JSON, and accumulates tool calls
//! across multiple deltas.

use std::fmt::Display;

use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use super::config::ToolCallFormat;
use super::errors::InferenceError;
use super::tool_call_parser::{parse_native_json_tool_call, parse_pythonic_tool_calls};
use super::types::{ChatCompletionChunk, StreamChunk, ToolCall};

// ─── SSE line parser ─────────────────────────────────────────────────────────

/// Parse a streaming HTTP response into `StreamChunk`s.
pub fn parse_sse_stream(
    response: reqwest::Response,
    tool_call_format: ToolCallFormat,
) -> impl Stream<Item = Result<StreamChunk, InferenceError>> + Send {
    parse_sse_bytes(response.bytes_stream(), tool_call_format)
}

/// Parse any byte stream carrying SSE events into `StreamChunk`s.
///
/// Events may be split across byte chunks; a partial event is buffered until
/// its terminating blank line arrives.
pub fn parse_sse_bytes<S, B, E>(
    byte_stream: S,
    tool_call_format: ToolCallFormat,
) -> impl Stream<Item = Result<StreamChunk, InferenceError>> + Send
where
    S: Stream<Item = Result<B, E>> + Unpin + Send,
    B: AsRef<[u8]>,
    E: Display,
{
    let state = StreamState::new(tool_call_format);

    stream::unfold(
        (byte_stream, state, String::new(), false),
        |(mut byte_stream, mut state, mut buffer, done)| async move {
            if done {
                return None;
            }
            loop {
                if let Some(event_end) = buffer.find("\n\n") {
                    let event: String = buffer.drain(..event_end + 2).collect();

                    match state.process_event(&event) {
                        Ok(EventOutcome::Chunk(chunk)) => {
                            return Some((Ok(chunk), (byte_stream, state, buffer, false)))
                        }
                        Ok(EventOutcome::Done(Some(chunk))) => {
                            return Some((Ok(chunk), (byte_stream, state, buffer, true)))
                        }
                        Ok(EventOutcome::Done(None)) => return None,
                        Ok(EventOutcome::Skip) => continue,
                        Err(e) => return Some((Err(e), (byte_stream, state, buffer, true))),
                    }
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(bytes.as_ref()));
                        // Normalize CRLF framing so the boundary search stays simple.
                        if buffer.contains('\r') {
                            buffer = buffer.replace("\r\n", "\n");
                        }
                    }
                    Some(Err(e)) => {
                        return Some((
                            Err(InferenceError::StreamError {
                                reason: format!("stream read error: {e}"),
                            }),
                            (byte_stream, state, buffer, true),
                        ));
                    }
                    None => {
                        // Stream ended without [DONE]; flush what is left.
                        let rest = std::mem::take(&mut buffer);
                        let outcome = if rest.trim().is_empty() {
                            state.finalize().map(EventOutcome::Done)
                        } else {
                            state.process_event(rest.trim()).and_then(|o| match o {
                                EventOutcome::Chunk(c) => Ok(EventOutcome::Done(Some(c))),
                                EventOutcome::Skip => state.finalize().map(EventOutcome::Done),
                                done => Ok(done),
                            })
                        };
                        return match outcome {
                            Ok(EventOutcome::Done(Some(chunk)))
                            | Ok(EventOutcome::Chunk(chunk)) => {
                                Some((Ok(chunk), (byte_stream, state, buffer, true)))
                            }
                            Ok(_) => None,
                            Err(e) => Some((Err(e), (byte_stream, state, buffer, true))),
                        };
                    }
                }
            }
        },
    )
}

// ─── Stream State ────────────────────────────────────────────────────────────

enum EventOutcome {
    Chunk(StreamChunk),
    /// `[DONE]` reached, with any tool calls still pending.
    Done(Option<StreamChunk>),
    /// Keep-alive, comment, or empty delta.
    Skip,
}

/// A native tool call being assembled from deltas.
struct PendingCall {
    index: u32,
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Mutable state for accumulating tool call fragments across SSE events.
struct StreamState {
    tool_call_format: ToolCallFormat,
    /// Accumulated content for Pythonic format parsing.
    accumulated_content: String,
    pending: Vec<PendingCall>,
}

impl StreamState {
    fn new(tool_call_format: ToolCallFormat) -> Self {
        Self {
            tool_call_format,
            accumulated_content: String::new(),
            pending: Vec::new(),
        }
    }

    /// Process a single SSE event string (may contain multiple `data:` lines).
    fn process_event(&mut self, event: &str) -> Result<EventOutcome, InferenceError> {
        let mut data_content = String::new();

        for line in event.lines() {
            if let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
                let data = data.trim();
                if data == "[DONE]" {
                    return self.finalize().map(EventOutcome::Done);
                }
                data_content.push_str(data);
            }
        }

        if data_content.is_empty() {
            return Ok(EventOutcome::Skip);
        }

        let chunk: ChatCompletionChunk =
            serde_json::from_str(&data_content).map_err(|e| InferenceError::StreamError {
                reason: format!("failed to parse SSE chunk: {e} (data: {data_content})"),
            })?;

        if let Some(error) = chunk.error {
            let reason = error
                .get("message")
                .and_then(|m| m.as_str())
                .map(String::from)
                .unwrap_or_else(|| error.to_string());
            return Err(InferenceError::StreamError { reason });
        }

        self.process_chunk(chunk)
    }

    fn process_chunk(&mut self, chunk: ChatCompletionChunk) -> Result<EventOutcome, InferenceError> {
        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(EventOutcome::Skip);
        };

        let mut result = StreamChunk {
            token: None,
            tool_calls: None,
            finish_reason: choice.finish_reason,
        };

        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            self.accumulated_content.push_str(&content);
            result.token = Some(content);
        }

        for tc in choice.delta.tool_calls.unwrap_or_default() {
            let index = tc.index.unwrap_or(0);
            let (name, args) = tc
                .function
                .map(|f| (f.name.unwrap_or_default(), f.arguments.unwrap_or_default()))
                .unwrap_or_default();

            match self.pending.iter_mut().find(|p| p.index == index) {
                Some(p) => {
                    p.name.push_str(&name);
                    p.arguments.push_str(&args);
                    if tc.id.is_some() {
                        p.id = tc.id;
                    }
                }
                None => self.pending.push(PendingCall {
                    index,
                    id: tc.id,
                    name,
                    arguments: args,
                }),
            }
        }

        match result.finish_reason.as_deref() {
            Some("tool_calls") => {
                result.tool_calls = Some(self.finalize_native_tool_calls()?);
            }
            Some("stop") if self.tool_call_format == ToolCallFormat::Pythonic => {
                let calls = parse_pythonic_tool_calls(&self.accumulated_content)?;
                self.accumulated_content.clear();
                if !calls.is_empty() {
                    result.tool_calls = Some(calls);
                    result.finish_reason = Some("tool_calls".into());
                }
            }
            _ => {}
        }

        if result.token.is_none() && result.tool_calls.is_none() && result.finish_reason.is_none() {
            return Ok(EventOutcome::Skip);
        }
        Ok(EventOutcome::Chunk(result))
    }

    fn finalize_native_tool_calls(&mut self) -> Result<Vec<ToolCall>, InferenceError> {
        let mut pending = std::mem::take(&mut self.pending);
        pending.sort_by_key(|p| p.index);
        pending
            .iter()
            .map(|p| parse_native_json_tool_call(p.id.as_deref(), &p.name, &p.arguments))
            .collect()
    }

    /// Finalize the stream and emit any remaining tool calls.
    fn finalize(&mut self) -> Result<Option<StreamChunk>, InferenceError> {
        if !self.pending.is_empty() {
            return Ok(Some(StreamChunk::calls(self.finalize_native_tool_calls()?)));
        }

        if self.tool_call_format == ToolCallFormat::Pythonic && !self.accumulated_content.is_empty() {
            let calls = parse_pythonic_tool_calls(&self.accumulated_content)?;
            self.accumulated_content.clear();
            if !calls.is_empty() {
                return Ok(Some(StreamChunk::calls(calls)));
            }
        }

        Ok(None)
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Parse a non-streaming response body into tool calls and content.
pub fn parse_non_streaming_response(
    body: &str,
    format: ToolCallFormat,
) -> Result<StreamChunk, InferenceError> {
    #[derive(Deserialize)]
    struct NonStreamResponse {
        choices: Vec<NonStreamChoice>,
    }

    #[derive(Deserialize)]
    struct NonStreamChoice {
        message: NonStreamMessage,
        finish_reason: Option<String>,
    }

    #[derive(Deserialize)]
    struct NonStreamMessage {
        content: Option<String>,
        tool_calls: Option<Vec<NonStreamToolCall>>,
    }

    #[derive(Deserialize)]
    struct NonStreamToolCall {
        id: Option<String>,
        function: NonStreamFunction,
    }

    #[derive(Deserialize)]
    struct NonStreamFunction {
        name: String,
        arguments: String,
    }

    let resp: NonStreamResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::StreamError {
            reason: format!("failed to parse non-streaming response: {e}"),
        })?;

    let choice = resp.choices.into_iter().next().ok_or(InferenceError::StreamError {
        reason: "empty choices array".into(),
    })?;

    let content = choice.message.content.filter(|c| !c.is_empty());

    let mut tool_calls = Vec::new();
    for tc in choice.message.tool_calls.unwrap_or_default() {
        let id = tc.id.unwrap_or_else(|| format!("call_{}", Uuid::new_v4()));
        tool_calls.push(parse_native_json_tool_call(
            Some(&id),
            &tc.function.name,
            &tc.function.arguments,
        )?);
    }

    if tool_calls.is_empty() && format == ToolCallFormat::Pythonic {
        if let Some(text) = content.as_deref() {
            tool_calls = parse_pythonic_tool_calls(text)?;
        }
    }

    let finish_reason = if tool_calls.is_empty() {
        choice.finish_reason
    } else {
        Some("tool_calls".into())
    };

    Ok(StreamChunk {
        token: content,
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        finish_reason,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(parts: Vec<&'static str>, format: ToolCallFormat) -> Vec<Result<StreamChunk, InferenceError>> {
        let bytes = stream::iter(parts.into_iter().map(Ok::<_, std::io::Error>));
        parse_sse_bytes(bytes, format).collect().await
    }

    #[tokio::test]
    async fn test_text_tokens_split_across_reads() {
        let chunks = collect(
            vec![
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n",
                "\ndata: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n",
                ": keep-alive\n\n",
                "data: [DONE]\n\n",
            ],
            ToolCallFormat::NativeJson,
        )
        .await;

        let text: String = chunks
            .into_iter()
            .map(|c| c.unwrap().token.unwrap_or_default())
            .collect();
        assert_eq!(text, "Hello");
    }

    #[tokio::test]
    async fn test_native_tool_call_fragments_accumulate() {
        let chunks = collect(
            vec![
                "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_a\",\"function\":{\"name\":\"submit_\",\"arguments\":\"{\\\"status\\\":\"}}]},\"finish_reason\":null}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"name\":\"result\",\"arguments\":\"\\\"answer_ready\\\"}\"}}]},\"finish_reason\":null}]}\n\n",
                "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
                "data: [DONE]\n\n",
            ],
            ToolCallFormat::NativeJson,
        )
        .await;

        let calls: Vec<ToolCall> = chunks
            .into_iter()
            .filter_map(|c| c.unwrap().tool_calls)
            .flatten()
            .collect();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].name, "submit_result");
        assert_eq!(calls[0].arguments["status"], "answer_ready");
    }

    #[tokio::test]
    async fn test_pending_calls_flushed_on_done() {
        let chunks = collect(
            vec![
                "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c\",\"function\":{\"name\":\"get_session_context\",\"arguments\":\"{}\"}}]},\"finish_reason\":null}]}\n\n",
                "data: [DONE]\n\n",
            ],
            ToolCallFormat::NativeJson,
        )
        .await;
        let last = chunks.into_iter().last().unwrap().unwrap();
        assert_eq!(last.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(last.tool_calls.unwrap()[0].name, "get_session_context");
    }

    #[tokio::test]
    async fn test_malformed_arguments_surface_as_parse_error() {
        let chunks = collect(
            vec![
                "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"name\":\"submit_result\",\"arguments\":\"{\\\"status\\\": \"}}]},\"finish_reason\":\"tool_calls\"}]}\n\n",
            ],
            ToolCallFormat::NativeJson,
        )
        .await;
        let err = chunks.into_iter().find_map(Result::err).unwrap();
        assert!(err.is_malformed_output());
    }

    #[tokio::test]
    async fn test_inline_provider_error() {
        let chunks = collect(
            vec!["data: {\"error\":{\"message\":\"Rate limit exceeded\"}}\n\n"],
            ToolCallFormat::NativeJson,
        )
        .await;
        let err = chunks.into_iter().find_map(Result::err).unwrap();
        assert!(err.is_provider_error());
    }

    #[test]
    fn test_parse_non_streaming_with_content() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"Hello"},"finish_reason":"stop"}]}"#;
        let chunk = parse_non_streaming_response(body, ToolCallFormat::NativeJson).unwrap();
        assert_eq!(chunk.token.as_deref(), Some("Hello"));
        assert!(chunk.tool_calls.is_none());
    }

    #[test]
    fn test_parse_non_streaming_pythonic() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"Tool: get_artifact\nArguments: {\"artifact_id\": \"a1\"}"},"finish_reason":"stop"}]}"#;
        let chunk = parse_non_streaming_response(body, ToolCallFormat::Pythonic).unwrap();
        assert_eq!(chunk.tool_calls.unwrap()[0].name, "get_artifact");
        assert_eq!(chunk.finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn test_parse_non_streaming_empty_choices() {
        assert!(parse_non_streaming_response(r#"{"choices": []}"#, ToolCallFormat::NativeJson).is_err());
    }
}
