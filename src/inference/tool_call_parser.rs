//! Tool call parsing: normalizes model output to `ToolCall` structs.
//!
//! Two formats are accepted (per the model's `tool_call_format`):
//!
//! 1. **native_json**: OpenAI JSON tool calls delivered as streaming deltas.
//! 2. **pythonic**: text lines of the form
//!    ```text
//!    Tool: generate_quiz
//!    Arguments: {"topic": "fractions"}
//!    ```
//!
//! Also hosts the lenient JSON repair used on malformed structured output.

use uuid::Uuid;

use super::errors::InferenceError;
use super::types::ToolCall;

// ─── Native JSON Parsing ─────────────────────────────────────────────────────

/// Parse a tool call from the accumulated streaming deltas (native_json format).
///
/// `name` and `arguments_json` are the concatenated values from all chunks
/// for a single tool call index. Empty arguments are treated as `{}`.
pub fn parse_native_json_tool_call(
    id: Option<&str>,
    name: &str,
    arguments_json: &str,
) -> Result<ToolCall, InferenceError> {
    let call_id = id
        .map(String::from)
        .unwrap_or_else(|| format!("call_{}", Uuid::new_v4()));

    if name.is_empty() {
        return Err(InferenceError::ToolCallParseError {
            raw_response: arguments_json.to_string(),
            reason: "empty tool name".into(),
        });
    }

    let arguments = if arguments_json.trim().is_empty() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_str(arguments_json).map_err(|e| InferenceError::ToolCallParseError {
            raw_response: arguments_json.to_string(),
            reason: format!("invalid JSON arguments for '{name}': {e}"),
        })?
    };

    Ok(ToolCall {
        id: call_id,
        name: name.to_string(),
        arguments,
    })
}

// ─── Pythonic Format Parsing ─────────────────────────────────────────────────

/// Extract tool calls from text content that uses the Pythonic format.
pub fn parse_pythonic_tool_calls(text: &str) -> Result<Vec<ToolCall>, InferenceError> {
    let mut calls = Vec::new();
    let mut lines = text.lines().map(str::trim).peekable();

    while let Some(line) = lines.next() {
        let Some(name) = line.strip_prefix("Tool:").or_else(|| line.strip_prefix("tool:")) else {
            continue;
        };
        let tool_name = name.trim();
        if tool_name.is_empty() {
            continue;
        }

        let args_line = lines.peek().and_then(|next| {
            next.strip_prefix("Arguments:")
                .or_else(|| next.strip_prefix("arguments:"))
        });

        let arguments = match args_line {
            Some(raw) => {
                let raw = raw.trim();
                let parsed = serde_json::from_str(raw).map_err(|e| {
                    InferenceError::ToolCallParseError {
                        raw_response: raw.to_string(),
                        reason: format!("invalid Pythonic arguments JSON: {e}"),
                    }
                })?;
                lines.next();
                parsed
            }
            None => serde_json::Value::Object(serde_json::Map::new()),
        };

        calls.push(ToolCall {
            id: format!("call_{}", Uuid::new_v4()),
            name: tool_name.to_string(),
            arguments,
        });
    }

    Ok(calls)
}

// ─── Malformed JSON Repair ───────────────────────────────────────────────────

/// Extract the raw arguments from a runtime's "error parsing tool call" body.
///
/// Runtimes report these as
/// `{"error":{"message":"error parsing tool call: raw='{...}', err=..."}}`.
pub fn extract_tool_call_from_error(error_body: &str) -> Option<String> {
    let parsed: serde_json::Value = serde_json::from_str(error_body).ok()?;
    let message = parsed
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())?;

    if !message.contains("error parsing tool call") {
        return None;
    }

    let raw_start = message.find("raw='")? + 5;
    let raw_len = message[raw_start..].rfind("', err=")?;
    Some(message[raw_start..raw_start + raw_len].to_string())
}

/// Parse model-produced JSON leniently.
///
/// Strips Markdown code fences and any prose around the outermost object,
/// then applies [`repair_malformed_tool_call_json`].
pub fn parse_lenient_json(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end().trim_end_matches("```").trim())
        .unwrap_or(trimmed);

    let candidate = match (unfenced.find('{'), unfenced.rfind('}')) {
        (Some(start), Some(end)) if end > start => &unfenced[start..=end],
        (Some(start), _) => &unfenced[start..],
        _ => unfenced,
    };

    repair_malformed_tool_call_json(candidate)
}

/// Attempt to repair malformed JSON arguments from a model tool call.
///
/// Common malformations:
/// 1. Doubled quotes after a colon: `"key":""value"`
/// 2. Trailing commas: `{"a":1,}`
/// 3. Missing closing braces
/// 4. Unescaped control characters in string values
///
/// Returns `Some(value)` if repair succeeds, `None` if irreparable.
pub fn repair_malformed_tool_call_json(raw: &str) -> Option<serde_json::Value> {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(raw) {
        return Some(v);
    }

    let repairs: [fn(&str) -> String; 4] = [
        repair_double_quotes,
        repair_trailing_commas,
        repair_unbalanced_braces,
        repair_control_characters,
    ];

    let mut repaired = raw.to_string();
    for repair in repairs {
        repaired = repair(&repaired);
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(&repaired) {
            return Some(v);
        }
    }

    None
}

/// Collapse `:""value` into `:"value"`. A legitimate empty string `:""` is
/// followed by `,` or `}` and is left alone.
fn repair_double_quotes(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if i + 3 < bytes.len()
            && bytes[i] == b':'
            && bytes[i + 1] == b'"'
            && bytes[i + 2] == b'"'
            && bytes[i + 3] != b','
            && bytes[i + 3] != b'}'
        {
            result.extend_from_slice(b":\"");
            i += 3;
            continue;
        }
        result.push(bytes[i]);
        i += 1;
    }

    String::from_utf8(result).unwrap_or_else(|_| input.to_string())
}

/// Remove commas that directly precede `}` or `]`.
fn repair_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut result = String::with_capacity(input.len());

    for (i, &ch) in chars.iter().enumerate() {
        if ch == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        result.push(ch);
    }

    result
}

/// Append closing braces and brackets to balance unmatched openers.
fn repair_unbalanced_braces(input: &str) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape_next = false;

    for ch in input.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => stack.push('}'),
            '[' if !in_string => stack.push(']'),
            '}' | ']' if !in_string => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut result = input.to_string();
    if in_string {
        result.push('"');
    }
    while let Some(closer) = stack.pop() {
        result.push(closer);
    }
    result
}

/// Remove non-printable control characters, keeping `\n`, `\r`, `\t`.
fn repair_control_characters(input: &str) -> String {
    input
        .chars()
        .filter(|&c| !c.is_control() || c == '\n' || c == '\r' || c == '\t')
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
