//! Streaming protocol: wire frames, pairing, and the per-turn merge queue.
//!
//! Producers push [`TurnEvent`]s through an [`EventSink`]; a single consumer
//! (see [`merge`]) feeds them to a [`StreamWriter`] which enforces the
//! start/finish and span pairing rules, and hands encoded frames to the
//! transport.

pub mod events;
pub mod frames;
pub mod merge;
pub mod writer;

pub use events::{EventSink, TurnEvent};
pub use frames::{Frame, DONE_FRAME, HEARTBEAT_FRAME, PROTOCOL_HEADER, PROTOCOL_VERSION};
pub use merge::{spawn_turn_stream, StreamSettings, TaskGuard};
pub use writer::StreamWriter;
