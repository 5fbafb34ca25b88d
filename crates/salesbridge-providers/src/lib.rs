//! Remote assistant service abstraction.
//!
//! The orchestrator talks to the hosted assistant through the
//! [`AssistantService`] trait. [`assistants::AssistantsClient`] implements it
//! over HTTP for Azure OpenAI and OpenAI.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use salesbridge_core::types::{Run, StreamEvent, ToolOutput};

#[cfg(feature = "assistants")]
pub mod assistants;
pub mod events;
pub mod sse;

/// Ordered stream of events for one run attachment.
pub type EventStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>;

/// Author of a thread message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Options for starting a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_instructions: Option<String>,
}

/// Fields pushed to the remote assistant during provisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantUpdate {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub instructions: String,
    pub tools: Vec<serde_json::Value>,
}

/// Remote assistant metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// The hosted assistant service: threads, runs, and generated files.
#[async_trait]
pub trait AssistantService: Send + Sync {
    async fn create_thread(&self) -> anyhow::Result<String>;

    async fn delete_thread(&self, thread_id: &str) -> anyhow::Result<()>;

    /// Append a message to a thread. Returns the message id.
    async fn append_message(
        &self,
        thread_id: &str,
        role: MessageRole,
        content: &str,
    ) -> anyhow::Result<String>;

    /// Start a run and stream its events.
    async fn start_run_stream(
        &self,
        thread_id: &str,
        assistant_id: &str,
        options: &RunOptions,
    ) -> anyhow::Result<EventStream>;

    /// Submit the outputs for a `requires_action` batch. The returned stream
    /// continues the same run.
    async fn submit_tool_outputs_stream(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> anyhow::Result<EventStream>;

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> anyhow::Result<()>;

    async fn get_run(&self, thread_id: &str, run_id: &str) -> anyhow::Result<Run>;

    async fn get_file_content(&self, file_id: &str) -> anyhow::Result<Vec<u8>>;

    async fn delete_file(&self, file_id: &str) -> anyhow::Result<()>;

    async fn retrieve_assistant(&self, assistant_id: &str) -> anyhow::Result<AssistantInfo>;

    async fn update_assistant(
        &self,
        assistant_id: &str,
        update: &AssistantUpdate,
    ) -> anyhow::Result<AssistantInfo>;
}
