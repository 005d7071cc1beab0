//! HTTP-facing layer.
//!
//! - `chat`: the turn dispatcher behind both chat endpoints
//! - `routes`: router, shared state, error mapping
//! - `session`: session and artifact lookups

pub mod chat;
pub mod routes;
pub mod session;

pub use chat::{ChatRequest, DispatchSettings, Dispatcher, Pipeline, Services, TurnMode, TurnSummary};
pub use routes::{router, AppState};
