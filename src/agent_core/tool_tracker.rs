//! Tool progress tracking.
//!
//! Wraps each tool execution so the stream can show `running` → `done` /
//! `error` with the wall-clock duration. Events go over a channel that the
//! orchestrator's progress monitor drains into the turn's event queue. Each
//! event carries an ack; the tracker waits for it, so a notice is queued
//! before anything the caller emits next.

use std::future::Future;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use super::types::{ToolEvent, ToolStatus};

/// One progress notice and the ack the monitor sends once it is queued.
#[derive(Debug)]
pub struct Progress {
    pub event: ToolEvent,
    ack: oneshot::Sender<()>,
}

impl Progress {
    /// Release the waiting tracker.
    pub fn ack(self) {
        let _ = self.ack.send(());
    }
}

#[derive(Debug, Clone)]
pub struct ToolTracker {
    tx: mpsc::Sender<Progress>,
}

impl ToolTracker {
    pub fn new(tx: mpsc::Sender<Progress>) -> Self {
        Self { tx }
    }

    /// A tracker plus the receiving end of its events.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Progress>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Run `fut`, emitting `running` before and `done`/`error` after.
    ///
    /// A closed receiver never fails the tool; progress is best-effort.
    pub async fn track<T, E, F>(&self, tool: &str, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.emit(ToolEvent {
            tool: tool.to_string(),
            status: ToolStatus::Running,
            message: None,
            duration_ms: None,
        })
        .await;

        let started = Instant::now();
        let result = fut.await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (status, message) = match &result {
            Ok(_) => (ToolStatus::Done, None),
            Err(e) => (ToolStatus::Error, Some(e.to_string())),
        };
        tracing::debug!(tool = %tool, ?status, duration_ms, "tool finished");
        self.emit(ToolEvent {
            tool: tool.to_string(),
            status,
            message,
            duration_ms: Some(duration_ms),
        })
        .await;

        result
    }

    /// Send and wait until the monitor has queued the event. A dropped
    /// monitor releases the wait.
    async fn emit(&self, event: ToolEvent) {
        let (ack, acked) = oneshot::channel();
        if self.tx.send(Progress { event, ack }).await.is_ok() {
            let _ = acked.await;
        }
    }
}
