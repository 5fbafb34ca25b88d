//! Closed set of function tools the assistant may call.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::ToolError;
use crate::query::{QueryResult, QueryStore};

/// Every function tool the assistant knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    AskDatabase,
}

impl Tool {
    pub const ALL: [Tool; 1] = [Tool::AskDatabase];

    /// Name as declared to the remote assistant.
    pub fn name(self) -> &'static str {
        match self {
            Tool::AskDatabase => "ask_database",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Function declaration sent to the assistant. `schema` is embedded so
    /// the model writes queries against the real tables.
    pub fn definition(self, schema: &str) -> serde_json::Value {
        match self {
            Tool::AskDatabase => json!({
                "type": "function",
                "function": {
                    "name": self.name(),
                    "description": "Use this function to answer user questions about contoso sales data. \
                                    Input should be a fully formed SQLite query.",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "query": {
                                "type": "string",
                                "description": format!(
                                    "SQLite query extracting info to answer the user's question. \
                                     SQLite should be written using this database schema: {schema} \
                                     The query should be returned in plain text, not in JSON."
                                ),
                            }
                        },
                        "required": ["query"],
                        "additionalProperties": false,
                    },
                },
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AskDatabaseArgs {
    pub query: String,
}

/// Parsed arguments, one variant per [`Tool`].
#[derive(Debug, Clone, PartialEq)]
pub enum ToolArgs {
    AskDatabase(AskDatabaseArgs),
}

impl ToolArgs {
    pub fn tool(&self) -> Tool {
        match self {
            ToolArgs::AskDatabase(_) => Tool::AskDatabase,
        }
    }
}

/// Resolves function calls by name and runs them against the shared store.
#[derive(Clone)]
pub struct ToolRegistry {
    store: Arc<QueryStore>,
}

impl ToolRegistry {
    pub fn new(store: Arc<QueryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<QueryStore> {
        &self.store
    }

    pub fn resolve(&self, name: &str) -> Result<Tool, ToolError> {
        Tool::from_name(name).ok_or_else(|| ToolError::UnknownTool(name.to_string()))
    }

    /// Parse the serialized argument payload the model produced.
    pub fn parse_arguments(&self, tool: Tool, raw: &str) -> Result<ToolArgs, ToolError> {
        let invalid = |e: serde_json::Error| ToolError::InvalidArguments {
            tool: tool.name().to_string(),
            message: e.to_string(),
        };
        match tool {
            Tool::AskDatabase => serde_json::from_str(raw)
                .map(ToolArgs::AskDatabase)
                .map_err(invalid),
        }
    }

    /// Run a tool. Query failures are reported inside the result; only a
    /// crashed worker is an error.
    pub async fn execute(&self, args: ToolArgs) -> Result<QueryResult, ToolError> {
        debug!(tool = args.tool().name(), "Executing tool");
        match args {
            ToolArgs::AskDatabase(AskDatabaseArgs { query }) => {
                let store = self.store.clone();
                tokio::task::spawn_blocking(move || store.execute(&query))
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))
            }
        }
    }

    /// Tool declarations for provisioning: the hosted code interpreter plus
    /// every local function tool.
    pub fn definitions(&self, schema: &str) -> Vec<serde_json::Value> {
        std::iter::once(json!({ "type": "code_interpreter" }))
            .chain(Tool::ALL.into_iter().map(|t| t.definition(schema)))
            .collect()
    }
}
