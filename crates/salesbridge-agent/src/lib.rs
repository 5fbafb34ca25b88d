//! Run orchestration for the sales assistant.
//!
//! A user message enters the [`session::SessionCoordinator`], which appends
//! it to the conversation's remote thread and starts a run. The run's event
//! stream is driven by an [`orchestrator::Orchestrator`] that projects text
//! and tool activity into [`UiEvent`]s, executes local tool calls and feeds
//! their outputs back until the run reaches a terminal status.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use salesbridge_core::types::RunStatus;

pub mod orchestrator;
pub mod prompt;
pub mod sanitize;
pub mod session;

pub use orchestrator::{Orchestrator, OrchestratorError, OrchestratorSettings};
pub use session::{CoordinatorError, SessionCoordinator};

/// Events emitted for the chat surface while a run is driven.
///
/// Delivery is fire-and-forget: a closed receiver never stops a run.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// A new outbound message, initially empty.
    OpenMessage { message_id: Uuid, author: String },

    /// Append a token to an open message.
    AppendToken { message_id: Uuid, token: String },

    /// Replace the full text of a message.
    ReplaceMessage { message_id: Uuid, text: String },

    FinalizeMessage { message_id: Uuid },

    /// Attach a fetched image or file to a message.
    AttachElement { message_id: Uuid, element: Element },

    /// A tool activity (code interpreter or function call) started.
    OpenActivity {
        activity_id: Uuid,
        name: String,
        language: String,
        started_at: DateTime<Utc>,
    },

    AppendActivityToken { activity_id: Uuid, token: String },

    /// Switch the display language of an activity (function calls render
    /// their result as SQL).
    SetActivityLanguage { activity_id: Uuid, language: String },

    CloseActivity {
        activity_id: Uuid,
        ended_at: DateTime<Utc>,
    },

    /// A standalone system message (errors, cancellation, busy).
    Notice { text: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Image,
    File,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub kind: ElementKind,
    pub name: String,
    pub bytes: Vec<u8>,
}

/// How a user turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The run reached a terminal status on its own.
    Finished(RunStatus),
    /// Stopped on request.
    Cancelled,
    /// The round-trip ceiling was hit; the last state is left visible.
    IterationLimit,
    /// The attachment was abandoned after an error.
    Failed(String),
}
