//! Internal turn events and the producer-side handle that emits them.
//!
//! Producers (dispatcher, orchestrator runner, tool-progress monitor) never
//! build wire frames. They push [`TurnEvent`]s into the turn's merge queue
//! and the single consumer turns them into frames in arrival order.

use tokio::sync::mpsc;

use crate::agent_core::types::ToolEvent;

/// Closed union of everything a turn can report.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Reasoning(String),
    Text(String),
    /// Ends the current step and opens the next one.
    StepBoundary,
    ToolInputStart {
        call_id: String,
        tool_name: String,
    },
    ToolInputAvailable {
        call_id: String,
        tool_name: String,
        input: serde_json::Value,
    },
    ToolOutput {
        call_id: String,
        output: serde_json::Value,
    },
    ToolProgress(ToolEvent),
    /// Named structured payload, sent as `data-<name>`.
    Data {
        name: String,
        payload: serde_json::Value,
    },
    /// Recoverable in-stream error; the stream still terminates normally.
    Error(String),
}

/// Producer handle for one turn. A sink without a queue (the synchronous
/// endpoint) drops every event.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<TurnEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<TurnEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that discards everything.
    pub fn noop() -> Self {
        Self { tx: None }
    }

    pub fn is_streaming(&self) -> bool {
        self.tx.is_some()
    }

    /// Send an event. A closed queue (client gone) is ignored here; the
    /// consumer side is responsible for tearing the turn down.
    pub async fn emit(&self, event: TurnEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }

    pub async fn reasoning(&self, text: impl Into<String>) {
        self.emit(TurnEvent::Reasoning(text.into())).await;
    }

    pub async fn text(&self, text: impl Into<String>) {
        self.emit(TurnEvent::Text(text.into())).await;
    }

    pub async fn step(&self) {
        self.emit(TurnEvent::StepBoundary).await;
    }

    pub async fn data(&self, name: &str, payload: serde_json::Value) {
        self.emit(TurnEvent::Data {
            name: name.to_string(),
            payload,
        })
        .await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.emit(TurnEvent::Error(message.into())).await;
    }
}
