//! Wire types shared between the remote service client and the orchestrator.
//!
//! These mirror the Assistants v2 run objects closely enough to deserialize
//! them directly; fields the orchestrator never reads are omitted.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a remote run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Incomplete,
    Expired,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    /// Whether the run can no longer make progress.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Cancelled
                | RunStatus::Failed
                | RunStatus::Completed
                | RunStatus::Incomplete
                | RunStatus::Expired
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::RequiresAction => "requires_action",
            RunStatus::Cancelling => "cancelling",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
            RunStatus::Completed => "completed",
            RunStatus::Incomplete => "incomplete",
            RunStatus::Expired => "expired",
            RunStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote run as reported by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub thread_id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_action: Option<RequiredAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RunError>,
}

impl Run {
    /// The batch of tool calls the run is blocked on, if any.
    pub fn pending_tool_calls(&self) -> &[RequiredToolCall] {
        match &self.required_action {
            Some(action) if self.status == RunStatus::RequiresAction => {
                &action.submit_tool_outputs.tool_calls
            }
            _ => &[],
        }
    }

    pub fn reference(&self) -> RunRef {
        RunRef {
            run_id: self.id.clone(),
            thread_id: self.thread_id.clone(),
        }
    }
}

/// Minimal handle identifying a run on a thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunRef {
    pub run_id: String,
    pub thread_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequiredAction {
    #[serde(rename = "type", default = "default_required_action_type")]
    pub action_type: String,
    pub submit_tool_outputs: SubmitToolOutputs,
}

fn default_required_action_type() -> String {
    "submit_tool_outputs".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitToolOutputs {
    pub tool_calls: Vec<RequiredToolCall>,
}

/// A function call the run is waiting on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequiredToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_function_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn default_function_type() -> String {
    "function".into()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Serialized JSON argument payload, exactly as the model produced it.
    #[serde(default)]
    pub arguments: String,
}

/// Output for one tool call, submitted back to the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

/// Kind of a tool call surfaced in a run step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    CodeInterpreter,
    Function,
    FileSearch,
}

impl ToolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolKind::CodeInterpreter => "code_interpreter",
            ToolKind::Function => "function",
            ToolKind::FileSearch => "file_search",
        }
    }

    /// Language tag used when displaying the call's streamed content.
    pub fn language(self) -> &'static str {
        match self {
            ToolKind::CodeInterpreter => "python",
            ToolKind::Function => "sql",
            ToolKind::FileSearch => "text",
        }
    }
}

/// Accumulated view of a tool call within a run step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallSnapshot {
    pub id: String,
    pub kind: ToolKind,
    /// Code accumulated so far (code interpreter only).
    #[serde(default)]
    pub code_input: String,
    /// Log output accumulated so far (code interpreter only).
    #[serde(default)]
    pub logs: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionCall>,
}

/// Finalized text content of one message block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    pub value: String,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

/// Annotation attached to a text block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Annotation {
    #[serde(rename = "file_path")]
    FilePath { text: String, file_path: FileRef },
    #[serde(rename = "file_citation")]
    FileCitation { text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRef {
    pub file_id: String,
}

/// Event emitted while draining one run stream.
///
/// Content blocks are delivered strictly in order; a block is always
/// closed before the next one opens.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The run's lifecycle changed.
    RunUpdated(Run),
    /// Raw delta for a message, before it is split into content blocks.
    MessageDelta { message_id: String, blocks: usize },
    TextCreated { message_id: String },
    TextDelta { message_id: String, value: String },
    TextDone { message_id: String, text: TextContent },
    ToolCallCreated(ToolCallSnapshot),
    /// A fragment of a tool call. `code_input` and `logs` hold only the new
    /// fragment; `snapshot` holds the accumulated call.
    ToolCallDelta {
        code_input: Option<String>,
        logs: Option<String>,
        snapshot: ToolCallSnapshot,
    },
    ToolCallDone(ToolCallSnapshot),
    ImageFileDone { file_id: String },
}
