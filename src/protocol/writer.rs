//! StreamWriter: turns [`TurnEvent`]s into correctly paired frames.
//!
//! Pairing rules it enforces regardless of what producers send:
//! - `start` is the first frame, `finish` the last (before `[DONE]`)
//! - every `start-step` gets exactly one `finish-step`
//! - a text or reasoning span is closed before any other frame kind is
//!   written, and before a span of the other kind opens
//! - nothing is written after `finish`

use super::events::TurnEvent;
use super::frames::Frame;

#[derive(Debug)]
pub struct StreamWriter {
    message_id: String,
    started: bool,
    finished: bool,
    step_open: bool,
    text_id: Option<String>,
    reasoning_id: Option<String>,
    next_span: u32,
}

impl StreamWriter {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            started: false,
            finished: false,
            step_open: false,
            text_id: None,
            reasoning_id: None,
            next_span: 0,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// `start` + the first `start-step`. Idempotent.
    pub fn begin(&mut self) -> Vec<Frame> {
        if self.started || self.finished {
            return Vec::new();
        }
        self.started = true;
        self.step_open = true;
        vec![
            Frame::Start {
                message_id: self.message_id.clone(),
            },
            Frame::StartStep,
        ]
    }

    pub fn push(&mut self, event: TurnEvent) -> Vec<Frame> {
        if self.finished {
            return Vec::new();
        }
        let mut frames = self.begin();
        if !self.step_open {
            frames.push(Frame::StartStep);
            self.step_open = true;
        }

        match event {
            TurnEvent::Reasoning(delta) => {
                if delta.is_empty() {
                    return frames;
                }
                self.close_text(&mut frames);
                let id = match &self.reasoning_id {
                    Some(id) => id.clone(),
                    None => {
                        let id = self.span_id("reasoning");
                        frames.push(Frame::ReasoningStart { id: id.clone() });
                        self.reasoning_id = Some(id.clone());
                        id
                    }
                };
                frames.push(Frame::ReasoningDelta { id, delta });
            }
            TurnEvent::Text(delta) => {
                if delta.is_empty() {
                    return frames;
                }
                self.close_reasoning(&mut frames);
                let id = match &self.text_id {
                    Some(id) => id.clone(),
                    None => {
                        let id = self.span_id("text");
                        frames.push(Frame::TextStart { id: id.clone() });
                        self.text_id = Some(id.clone());
                        id
                    }
                };
                frames.push(Frame::TextDelta { id, delta });
            }
            TurnEvent::StepBoundary => {
                self.close_spans(&mut frames);
                frames.push(Frame::FinishStep);
                frames.push(Frame::StartStep);
            }
            TurnEvent::ToolInputStart { call_id, tool_name } => {
                self.close_spans(&mut frames);
                frames.push(Frame::ToolInputStart {
                    tool_call_id: call_id,
                    tool_name,
                });
            }
            TurnEvent::ToolInputAvailable {
                call_id,
                tool_name,
                input,
            } => {
                self.close_spans(&mut frames);
                frames.push(Frame::ToolInputAvailable {
                    tool_call_id: call_id,
                    tool_name,
                    input,
                });
            }
            TurnEvent::ToolOutput { call_id, output } => {
                self.close_spans(&mut frames);
                frames.push(Frame::ToolOutputAvailable {
                    tool_call_id: call_id,
                    output,
                });
            }
            TurnEvent::ToolProgress(event) => {
                self.close_spans(&mut frames);
                let payload = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
                frames.push(Frame::data("tool-progress", payload));
            }
            TurnEvent::Data { name, payload } => {
                self.close_spans(&mut frames);
                frames.push(Frame::data(name, payload));
            }
            TurnEvent::Error(message) => {
                self.close_spans(&mut frames);
                frames.push(Frame::error(message));
            }
        }
        frames
    }

    /// Close everything and write `finish`. Safe to call without `begin`.
    pub fn finish(&mut self) -> Vec<Frame> {
        if self.finished {
            return Vec::new();
        }
        let mut frames = self.begin();
        self.close_spans(&mut frames);
        if self.step_open {
            frames.push(Frame::FinishStep);
            self.step_open = false;
        }
        frames.push(Frame::Finish);
        self.finished = true;
        frames
    }

    /// An error frame followed by [`finish`](Self::finish).
    pub fn fail(&mut self, message: impl Into<String>) -> Vec<Frame> {
        let mut frames = self.push(TurnEvent::Error(message.into()));
        frames.extend(self.finish());
        frames
    }

    fn span_id(&mut self, kind: &str) -> String {
        self.next_span += 1;
        format!("{kind}-{}", self.next_span)
    }

    fn close_text(&mut self, frames: &mut Vec<Frame>) {
        if let Some(id) = self.text_id.take() {
            frames.push(Frame::TextEnd { id });
        }
    }

    fn close_reasoning(&mut self, frames: &mut Vec<Frame>) {
        if let Some(id) = self.reasoning_id.take() {
            frames.push(Frame::ReasoningEnd { id });
        }
    }

    fn close_spans(&mut self, frames: &mut Vec<Frame>) {
        self.close_reasoning(frames);
        self.close_text(frames);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(frames: &[Frame]) -> Vec<String> {
        frames.iter().map(Frame::type_name).collect()
    }

    fn run(events: Vec<TurnEvent>) -> Vec<Frame> {
        let mut writer = StreamWriter::new("msg-1");
        let mut frames = writer.begin();
        for event in events {
            frames.extend(writer.push(event));
        }
        frames.extend(writer.finish());
        frames
    }

    #[test]
    fn test_chat_turn_sequence() {
        let frames = run(vec![
            TurnEvent::Reasoning("Intent chat_smalltalk".into()),
            TurnEvent::Data {
                name: "action".into(),
                payload: serde_json::json!({"action": "chat"}),
            },
            TurnEvent::Text("你好".into()),
            TurnEvent::Text("！".into()),
        ]);
        assert_eq!(
            types(&frames),
            vec![
                "start",
                "start-step",
                "reasoning-start",
                "reasoning-delta",
                "reasoning-end",
                "data-action",
                "text-start",
                "text-delta",
                "text-delta",
                "text-end",
                "finish-step",
                "finish",
            ]
        );
    }

    #[test]
    fn test_step_boundary_pairs_steps() {
        let frames = run(vec![
            TurnEvent::Text("a".into()),
            TurnEvent::StepBoundary,
            TurnEvent::Text("b".into()),
            TurnEvent::StepBoundary,
        ]);
        let t = types(&frames);
        let starts = t.iter().filter(|s| *s == "start-step").count();
        let finishes = t.iter().filter(|s| *s == "finish-step").count();
        assert_eq!(starts, 3);
        assert_eq!(starts, finishes);
        assert_eq!(t.iter().filter(|s| *s == "text-start").count(), 2);
        assert_eq!(t.iter().filter(|s| *s == "text-end").count(), 2);
    }

    #[test]
    fn test_reasoning_and_text_never_overlap() {
        let frames = run(vec![
            TurnEvent::Text("a".into()),
            TurnEvent::Reasoning("r".into()),
            TurnEvent::Text("b".into()),
        ]);
        let mut open: Option<&str> = None;
        for f in &frames {
            match f {
                Frame::TextStart { .. } => {
                    assert!(open.is_none());
                    open = Some("text");
                }
                Frame::ReasoningStart { .. } => {
                    assert!(open.is_none());
                    open = Some("reasoning");
                }
                Frame::TextEnd { .. } | Frame::ReasoningEnd { .. } => open = None,
                _ => {}
            }
        }
        assert!(open.is_none());
    }

    #[test]
    fn test_tool_events_close_text() {
        let frames = run(vec![
            TurnEvent::Text("Let me build that".into()),
            TurnEvent::ToolInputStart {
                call_id: "c1".into(),
                tool_name: "generate_quiz".into(),
            },
        ]);
        let t = types(&frames);
        let end = t.iter().position(|s| s == "text-end").unwrap();
        let tool = t.iter().position(|s| s == "tool-input-start").unwrap();
        assert!(end < tool);
    }

    #[test]
    fn test_fail_still_finishes() {
        let mut writer = StreamWriter::new("m");
        let mut frames = writer.begin();
        frames.extend(writer.push(TurnEvent::Text("partial".into())));
        frames.extend(writer.fail("backend exploded"));
        let t = types(&frames);
        assert_eq!(t.last().map(String::as_str), Some("finish"));
        assert!(t.contains(&"error".to_string()));
        assert_eq!(
            t.iter().filter(|s| *s == "start-step").count(),
            t.iter().filter(|s| *s == "finish-step").count()
        );
    }

    #[test]
    fn test_nothing_after_finish() {
        let mut writer = StreamWriter::new("m");
        writer.finish();
        assert!(writer.push(TurnEvent::Text("late".into())).is_empty());
        assert!(writer.finish().is_empty());
        assert!(writer.is_finished());
    }

    #[test]
    fn test_finish_without_begin_is_well_formed() {
        let mut writer = StreamWriter::new("m");
        assert_eq!(types(&writer.finish()), vec!["start", "start-step", "finish-step", "finish"]);
    }
}
