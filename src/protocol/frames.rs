//! Wire frames of the UI message stream.
//!
//! Each frame is one `data: <JSON>\n\n` line. JSON fields are camelCase and
//! `type` is always the first key, which some clients rely on when sniffing
//! frames without a full parse.

use serde::ser::{Serialize, SerializeMap, Serializer};

/// Terminates every stream, on success and failure alike.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// SSE comment; ignored by protocol parsers, keeps idle proxies from closing.
pub const HEARTBEAT_FRAME: &str = ": heartbeat\n\n";

/// Value of the `x-vercel-ai-ui-message-stream` header.
pub const PROTOCOL_VERSION: &str = "v1";

/// Header naming the stream protocol.
pub const PROTOCOL_HEADER: &str = "x-vercel-ai-ui-message-stream";

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Start { message_id: String },
    Finish,
    StartStep,
    FinishStep,
    ReasoningStart { id: String },
    ReasoningDelta { id: String, delta: String },
    ReasoningEnd { id: String },
    TextStart { id: String },
    TextDelta { id: String, delta: String },
    TextEnd { id: String },
    ToolInputStart { tool_call_id: String, tool_name: String },
    ToolInputAvailable {
        tool_call_id: String,
        tool_name: String,
        input: serde_json::Value,
    },
    ToolOutputAvailable {
        tool_call_id: String,
        output: serde_json::Value,
    },
    /// Serialized as `type: "data-<name>"`.
    Data { name: String, data: serde_json::Value },
    Error { error_text: String },
}

impl Frame {
    /// The `type` discriminator as written on the wire.
    pub fn type_name(&self) -> String {
        let name = match self {
            Frame::Start { .. } => "start",
            Frame::Finish => "finish",
            Frame::StartStep => "start-step",
            Frame::FinishStep => "finish-step",
            Frame::ReasoningStart { .. } => "reasoning-start",
            Frame::ReasoningDelta { .. } => "reasoning-delta",
            Frame::ReasoningEnd { .. } => "reasoning-end",
            Frame::TextStart { .. } => "text-start",
            Frame::TextDelta { .. } => "text-delta",
            Frame::TextEnd { .. } => "text-end",
            Frame::ToolInputStart { .. } => "tool-input-start",
            Frame::ToolInputAvailable { .. } => "tool-input-available",
            Frame::ToolOutputAvailable { .. } => "tool-output-available",
            Frame::Data { name, .. } => return format!("data-{name}"),
            Frame::Error { .. } => "error",
        };
        name.to_string()
    }

    pub fn data(name: impl Into<String>, data: serde_json::Value) -> Self {
        Frame::Data {
            name: name.into(),
            data,
        }
    }

    pub fn error(error_text: impl Into<String>) -> Self {
        Frame::Error {
            error_text: error_text.into(),
        }
    }

    /// `data: <JSON>\n\n`.
    pub fn to_sse(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => format!("data: {json}\n\n"),
            Err(e) => {
                tracing::error!(error = %e, frame = %self.type_name(), "frame serialization failed");
                let fallback = serde_json::json!({
                    "type": "error",
                    "errorText": format!("failed to encode {} frame", self.type_name()),
                });
                format!("data: {fallback}\n\n")
            }
        }
    }
}

impl Serialize for Frame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", &self.type_name())?;
        match self {
            Frame::Start { message_id } => map.serialize_entry("messageId", message_id)?,
            Frame::Finish | Frame::StartStep | Frame::FinishStep => {}
            Frame::ReasoningStart { id }
            | Frame::ReasoningEnd { id }
            | Frame::TextStart { id }
            | Frame::TextEnd { id } => map.serialize_entry("id", id)?,
            Frame::ReasoningDelta { id, delta } | Frame::TextDelta { id, delta } => {
                map.serialize_entry("id", id)?;
                map.serialize_entry("delta", delta)?;
            }
            Frame::ToolInputStart {
                tool_call_id,
                tool_name,
            } => {
                map.serialize_entry("toolCallId", tool_call_id)?;
                map.serialize_entry("toolName", tool_name)?;
            }
            Frame::ToolInputAvailable {
                tool_call_id,
                tool_name,
                input,
            } => {
                map.serialize_entry("toolCallId", tool_call_id)?;
                map.serialize_entry("toolName", tool_name)?;
                map.serialize_entry("input", input)?;
            }
            Frame::ToolOutputAvailable {
                tool_call_id,
                output,
            } => {
                map.serialize_entry("toolCallId", tool_call_id)?;
                map.serialize_entry("output", output)?;
            }
            Frame::Data { data, .. } => map.serialize_entry("data", data)?,
            Frame::Error { error_text } => map.serialize_entry("errorText", error_text)?,
        }
        map.end()
    }
}
