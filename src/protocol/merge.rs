//! Per-turn merge queue and its single consumer.
//!
//! ```text
//!  producer task ──┐
//!   ├─ runner    ──┤ mpsc<TurnEvent> ──► consumer ──► StreamWriter ──► mpsc<String> ──► HTTP body
//!   └─ monitor   ──┘                       │
//!                                          └─ heartbeat on silence, abort producer on disconnect
//! ```
//!
//! Frame order equals queue arrival order. The consumer owns a [`TaskGuard`]
//! over the producer, so a dropped client tears the whole turn down. A
//! panicking or failing producer yields an `error` frame and the stream still
//! ends with `finish` and `[DONE]`.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_stream::wrappers::ReceiverStream;

use super::events::{EventSink, TurnEvent};
use super::frames::{Frame, DONE_FRAME, HEARTBEAT_FRAME};
use super::writer::StreamWriter;
use crate::config::StreamConfig;

/// Aborts the guarded tasks when dropped.
#[derive(Debug, Default)]
pub struct TaskGuard {
    handles: Vec<AbortHandle>,
}

impl TaskGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch<T>(&mut self, handle: &JoinHandle<T>) {
        self.handles.push(handle.abort_handle());
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Timing and sizing of one turn stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub heartbeat: Duration,
    pub capacity: usize,
}

impl From<&StreamConfig> for StreamSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            heartbeat: config.heartbeat(),
            capacity: config.queue_capacity.max(1),
        }
    }
}

/// Run `producer` as its own task and return the encoded SSE frames.
///
/// The producer receives the turn's [`EventSink`]; when it returns (and every
/// clone of the sink is dropped) the stream is finished.
pub fn spawn_turn_stream<F, Fut, E>(
    settings: StreamSettings,
    message_id: String,
    producer: F,
) -> ReceiverStream<String>
where
    F: FnOnce(EventSink) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let (event_tx, event_rx) = mpsc::channel::<TurnEvent>(settings.capacity);
    let (out_tx, out_rx) = mpsc::channel::<String>(settings.capacity);

    let producer = tokio::spawn(producer(EventSink::new(event_tx)));
    tokio::spawn(consume(settings.heartbeat, message_id, producer, event_rx, out_tx));

    ReceiverStream::new(out_rx)
}

async fn consume<E: Display>(
    heartbeat: Duration,
    message_id: String,
    mut producer: JoinHandle<Result<(), E>>,
    mut events: mpsc::Receiver<TurnEvent>,
    out: mpsc::Sender<String>,
) {
    let mut guard = TaskGuard::new();
    guard.watch(&producer);

    let mut writer = StreamWriter::new(message_id);
    if !send_frames(&out, writer.begin()).await {
        return;
    }

    loop {
        tokio::select! {
            _ = out.closed() => {
                tracing::info!(message_id = %writer.message_id(), "client disconnected, cancelling turn");
                return;
            }
            next = tokio::time::timeout(heartbeat, events.recv()) => match next {
                Err(_) => {
                    if out.send(HEARTBEAT_FRAME.to_string()).await.is_err() {
                        return;
                    }
                }
                Ok(Some(event)) => {
                    if !send_frames(&out, writer.push(event)).await {
                        return;
                    }
                }
                Ok(None) => break,
            }
        }
    }

    let closing = match (&mut producer).await {
        Ok(Ok(())) => writer.finish(),
        Ok(Err(e)) => {
            tracing::warn!(message_id = %writer.message_id(), error = %e, "turn failed");
            writer.fail(e.to_string())
        }
        Err(e) if e.is_panic() => {
            tracing::error!(message_id = %writer.message_id(), "turn producer panicked");
            writer.fail("internal error while processing the turn")
        }
        Err(_) => writer.fail("turn was cancelled"),
    };

    if send_frames(&out, closing).await {
        let _ = out.send(DONE_FRAME.to_string()).await;
    }
}

/// Returns `false` once the client is gone.
async fn send_frames(out: &mpsc::Sender<String>, frames: Vec<Frame>) -> bool {
    for frame in frames {
        if out.send(frame.to_sse()).await.is_err() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn settings(heartbeat_ms: u64) -> StreamSettings {
        StreamSettings {
            heartbeat: Duration::from_millis(heartbeat_ms),
            capacity: 16,
        }
    }

    fn frame_types(lines: &[String]) -> Vec<String> {
        lines
            .iter()
            .filter_map(|l| l.strip_prefix("data: "))
            .map(|json| match serde_json::from_str::<serde_json::Value>(json.trim()) {
                Ok(v) => v["type"].as_str().unwrap_or_default().to_string(),
                Err(_) => json.trim().to_string(),
            })
            .collect()
    }

    fn count(types: &[String], name: &str) -> usize {
        types.iter().filter(|t| *t == name).count()
    }

    #[tokio::test]
    async fn test_successful_turn_is_framed() {
        let stream = spawn_turn_stream(settings(5_000), "m1".into(), |sink| async move {
            sink.reasoning("chat").await;
            sink.text("hello").await;
            Ok::<_, String>(())
        });
        let lines: Vec<String> = stream.collect().await;
        let types = frame_types(&lines);
        assert_eq!(types.first().map(String::as_str), Some("start"));
        assert_eq!(&types[types.len() - 2..], &["finish".to_string(), "[DONE]".to_string()]);
        assert_eq!(count(&types, "start-step"), count(&types, "finish-step"));
        assert_eq!(lines.last().map(String::as_str), Some(DONE_FRAME));
    }

    #[tokio::test]
    async fn test_producer_error_yields_error_frame_then_done() {
        let stream = spawn_turn_stream(settings(5_000), "m2".into(), |sink| async move {
            sink.text("partial").await;
            Err::<(), _>("generation failed: all models unavailable")
        });
        let types = frame_types(&stream.collect::<Vec<_>>().await);
        assert!(types.contains(&"error".to_string()));
        assert_eq!(types.last().map(String::as_str), Some("[DONE]"));
        assert_eq!(count(&types, "text-start"), count(&types, "text-end"));
        assert_eq!(count(&types, "start-step"), count(&types, "finish-step"));
    }

    #[tokio::test]
    async fn test_producer_panic_still_terminates() {
        let stream = spawn_turn_stream(settings(5_000), "m3".into(), |sink| async move {
            sink.text("about to fail").await;
            if sink.is_streaming() {
                panic!("boom");
            }
            Ok::<_, String>(())
        });
        let types = frame_types(&stream.collect::<Vec<_>>().await);
        assert!(types.contains(&"error".to_string()));
        assert_eq!(&types[types.len() - 2..], &["finish".to_string(), "[DONE]".to_string()]);
    }

    #[tokio::test]
    async fn test_heartbeat_on_silence() {
        let stream = spawn_turn_stream(settings(20), "m4".into(), |sink| async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            sink.text("late").await;
            Ok::<_, String>(())
        });
        let lines: Vec<String> = stream.collect().await;
        assert!(lines.iter().any(|l| l == HEARTBEAT_FRAME));
        // heartbeats are comments, never inside the typed sequence count
        let types = frame_types(&lines);
        assert_eq!(count(&types, "start-step"), count(&types, "finish-step"));
    }

    #[tokio::test]
    async fn test_client_disconnect_aborts_producer() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let mut stream = spawn_turn_stream(settings(5_000), "m5".into(), move |sink| async move {
            sink.text("first").await;
            tokio::time::sleep(Duration::from_millis(300)).await;
            flag.store(true, Ordering::SeqCst);
            Ok::<_, String>(())
        });
        // read the first frame, then hang up
        assert!(stream.next().await.is_some());
        drop(stream);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_task_guard_aborts_on_drop() {
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        {
            let mut guard = TaskGuard::new();
            guard.watch(&handle);
        }
        let err = handle.await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
