//! Agent Core: orchestration layer of the gateway.
//!
//! Submodules:
//! - `router`: Confidence Router over classifier output
//! - `entity_resolver`: Deterministic class/student/assignment resolution
//! - `toolset`: Capability-group gate for the tool-calling loop
//! - `conversation`: Session turn log, windows, clarification continuation
//! - `session_store`: Session persistence (in-memory, SQLite)
//! - `artifacts`: Versioned artifact storage with per-id write serialization
//! - `database`: SQLite schema and queries shared by the stores
//! - `tool_tracker`: running/done/error progress for tool executions
//! - `validation`: Terminal-state validation and retry policy
//! - `orchestrator`: Tool-calling loop with model fallback and repair
//! - `text`: UTF-8 safe truncation and previews
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod artifacts;
pub mod conversation;
pub mod database;
pub mod entity_resolver;
pub mod errors;
pub mod orchestrator;
pub mod router;
pub mod session_store;
pub mod text;
pub mod tool_tracker;
pub mod toolset;
pub mod types;
pub mod validation;

// Re-exports for convenience
pub use artifacts::{ArtifactService, ArtifactStore, InMemoryArtifactStore, SqliteArtifactStore};
pub use database::AgentDatabase;
pub use entity_resolver::{EntityResolver, ResolveContext, ResolveResult, Roster};
pub use errors::AgentError;
pub use orchestrator::{AgentOutcome, AgentRequest, ToolOrchestrator};
pub use router::RouterResult;
pub use session_store::{InMemorySessionStore, SessionStore, SqliteSessionStore};
pub use toolset::{CapabilityGroup, TurnFlags};
pub use types::{Artifact, ConversationSession, FinalResult, SessionSummary, Turn};
