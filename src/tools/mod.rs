//! Built-in tools: the catalogue the tool-calling loop can use.
//!
//! - `registry`: tool specs, capability groups, name correction
//! - `builtin`: the executor behind each tool
//! - `errors`: tool-level failures, reported back to the model

pub mod builtin;
pub mod errors;
pub mod registry;

pub use builtin::{BuiltinTools, ToolContext, ToolOutput};
pub use errors::ToolError;
pub use registry::{ToolRegistry, ToolResolution, ToolSpec, MIN_CORRECTION_SIMILARITY, SUBMIT_RESULT};
