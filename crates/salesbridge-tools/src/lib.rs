//! Local capabilities exposed to the remote assistant.
//!
//! The only capability is a read-only query over the sales database
//! ([`query::QueryStore`]). The set of tools is closed: [`registry::Tool`]
//! enumerates them and [`registry::ToolRegistry`] resolves and dispatches
//! function calls by name.

pub mod query;
pub mod registry;

pub use query::{QueryResult, QueryStatus, QueryStore};
pub use registry::{Tool, ToolArgs, ToolRegistry};

/// Failure to resolve or run a tool call.
///
/// Query failures are not errors here: they come back as a
/// [`QueryResult`] with [`QueryStatus::Error`] so the model can retry.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("tool execution failed: {0}")]
    Execution(String),
}
