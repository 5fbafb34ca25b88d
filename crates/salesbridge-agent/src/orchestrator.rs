//! Run event orchestrator: drives one user turn's run to completion.
//!
//! Each stream the service hands back (the initial run stream, then one per
//! tool-output submission) is drained with a fresh [`Attachment`] so message
//! and activity projections never leak between continuations. The loop is
//! iterative: a submission yields the next stream and the loop re-attaches.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use salesbridge_core::config::Config;
use salesbridge_core::types::{
    Annotation, Run, RunRef, RunStatus, StreamEvent, TextContent, ToolCallSnapshot, ToolKind,
    ToolOutput,
};
use salesbridge_providers::{AssistantService, EventStream};
use salesbridge_tools::{Tool, ToolError, ToolRegistry};

use crate::sanitize::{OutputSanitizer, Passthrough};
use crate::{Element, ElementKind, RunOutcome, UiEvent};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{0}")]
    Service(#[from] anyhow::Error),

    #[error("{0}")]
    ToolResolution(ToolError),

    #[error("run did not reach a terminal status after {attempts} status checks")]
    Timeout { attempts: u32 },

    #[error("event stream ended before a run was reported")]
    StreamEnded,
}

/// Per-turn limits and display policy.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Author shown on assistant messages.
    pub assistant_name: String,
    /// Tool-output submissions allowed per turn; `None` is unbounded.
    pub max_round_trips: Option<u32>,
    pub poll_attempts: u32,
    pub poll_interval: Duration,
    /// Keep generated files on the service after downloading them.
    pub retain_remote_files: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            assistant_name: "Sales Analysis Assistant".into(),
            max_round_trips: Some(5),
            poll_attempts: 10,
            poll_interval: Duration::from_millis(1000),
            retain_remote_files: true,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            assistant_name: config.assistant_name(),
            max_round_trips: config.max_round_trips(),
            poll_attempts: config.poll_attempts(),
            poll_interval: Duration::from_millis(config.poll_interval_ms()),
            retain_remote_files: config.retain_remote_files(),
        }
    }
}

/// What draining one stream led to.
enum Step {
    Terminal(RunStatus),
    Continue(EventStream),
    Cancelled,
    IterationLimit,
}

/// Projection state for one stream attachment.
#[derive(Default)]
struct Attachment {
    message: Option<MessageProjection>,
    activities: HashMap<String, ActivityProjection>,
    current_call: Option<String>,
}

struct MessageProjection {
    id: Uuid,
    text: String,
    rewritten: bool,
    finalized: bool,
}

struct ActivityProjection {
    id: Uuid,
    has_logs: bool,
}

/// State that outlives a single attachment.
#[derive(Default)]
struct Turn {
    last_run: Option<Run>,
    round_trips: u32,
}

pub struct Orchestrator {
    service: Arc<dyn AssistantService>,
    tools: Arc<ToolRegistry>,
    ui: mpsc::UnboundedSender<UiEvent>,
    sanitizer: Arc<dyn OutputSanitizer>,
    settings: OrchestratorSettings,
    run_ref: watch::Sender<Option<RunRef>>,
}

impl Orchestrator {
    pub fn new(
        service: Arc<dyn AssistantService>,
        tools: Arc<ToolRegistry>,
        ui: mpsc::UnboundedSender<UiEvent>,
        settings: OrchestratorSettings,
    ) -> Self {
        let (run_ref, _) = watch::channel(None);
        Self {
            service,
            tools,
            ui,
            sanitizer: Arc::new(Passthrough),
            settings,
            run_ref,
        }
    }

    pub fn with_sanitizer(mut self, sanitizer: Arc<dyn OutputSanitizer>) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    /// Publish the run being driven on `tx` instead of a private channel.
    pub fn with_run_ref(mut self, tx: watch::Sender<Option<RunRef>>) -> Self {
        self.run_ref = tx;
        self
    }

    pub fn run_updates(&self) -> watch::Receiver<Option<RunRef>> {
        self.run_ref.subscribe()
    }

    /// Drive a run from its first event stream until it settles, is
    /// cancelled, or hits the round-trip ceiling. Never fails: errors are
    /// reported to the user and end the turn.
    pub async fn drive(&self, stream: EventStream, cancel: &CancellationToken) -> RunOutcome {
        let mut turn = Turn::default();
        let mut stream = stream;

        loop {
            let mut attachment = Attachment::default();
            let step = self.attach(stream, &mut attachment, &mut turn, cancel).await;
            self.close_attachment(&mut attachment);

            match step {
                Ok(Step::Continue(next)) => {
                    debug!(round_trips = turn.round_trips, "Re-attaching to run continuation");
                    stream = next;
                }
                Ok(Step::Terminal(status)) => {
                    info!(%status, round_trips = turn.round_trips, "Run settled");
                    return RunOutcome::Finished(status);
                }
                Ok(Step::Cancelled) => {
                    let run_id = self.cancel_remote(&turn).await;
                    self.notice(match run_id {
                        Some(id) => format!("Run cancelled. {id}"),
                        None => "Run cancelled.".to_string(),
                    });
                    return RunOutcome::Cancelled;
                }
                Ok(Step::IterationLimit) => {
                    warn!(round_trips = turn.round_trips, "Round-trip ceiling reached");
                    return RunOutcome::IterationLimit;
                }
                Err(e) => {
                    error!(error = %e, "Run attachment failed");
                    // A run left active blocks the thread for the next message.
                    self.cancel_remote(&turn).await;
                    self.notice(format!("An error occurred: {e}"));
                    self.notice("Please try again in a moment.".to_string());
                    return RunOutcome::Failed(e.to_string());
                }
            }
        }
    }

    async fn attach(
        &self,
        mut stream: EventStream,
        attachment: &mut Attachment,
        turn: &mut Turn,
        cancel: &CancellationToken,
    ) -> Result<Step, OrchestratorError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Step::Cancelled),
                next = stream.next() => next,
            };
            let Some(event) = next else { break };

            match event? {
                StreamEvent::RunUpdated(run) => {
                    trace!(run_id = %run.id, status = %run.status, "Run updated");
                    self.run_ref.send_replace(Some(run.reference()));
                    let status = run.status;
                    turn.last_run = Some(run.clone());

                    if status == RunStatus::RequiresAction {
                        return self
                            .handle_required_action(&run, attachment, turn, cancel)
                            .await;
                    }
                    if status.is_terminal() {
                        return Ok(self.settle(&run));
                    }
                }
                StreamEvent::MessageDelta { message_id, blocks } => {
                    trace!(%message_id, blocks, "Message delta");
                }
                StreamEvent::TextCreated { .. } => {
                    self.open_message(attachment);
                }
                StreamEvent::TextDelta { value, .. } => self.on_text_delta(attachment, &value),
                StreamEvent::TextDone { text, .. } => self.on_text_done(attachment, text).await?,
                StreamEvent::ToolCallCreated(snapshot) => {
                    self.open_activity(attachment, &snapshot.id, snapshot.kind);
                }
                StreamEvent::ToolCallDelta {
                    code_input,
                    logs,
                    snapshot,
                } => self.on_tool_call_delta(attachment, code_input, logs, &snapshot),
                StreamEvent::ToolCallDone(snapshot) => self.on_tool_call_done(attachment, &snapshot),
                StreamEvent::ImageFileDone { file_id } => self.on_image(attachment, &file_id).await?,
            }
        }

        self.poll_until_settled(turn, cancel).await
    }

    /// Stream ended without a terminal status: check the run directly.
    async fn poll_until_settled(
        &self,
        turn: &mut Turn,
        cancel: &CancellationToken,
    ) -> Result<Step, OrchestratorError> {
        let Some(run) = turn.last_run.clone() else {
            return Err(OrchestratorError::StreamEnded);
        };
        if run.status.is_terminal() {
            return Ok(self.settle(&run));
        }

        let attempts = self.settings.poll_attempts;
        for attempt in 1..=attempts {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Step::Cancelled),
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }

            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Step::Cancelled),
                polled = self.service.get_run(&run.thread_id, &run.id) => polled?,
            };
            debug!(attempt, status = %polled.status, "Polled run status");
            self.run_ref.send_replace(Some(polled.reference()));
            turn.last_run = Some(polled.clone());

            if polled.status.is_terminal() {
                return Ok(self.settle(&polled));
            }
            if polled.status == RunStatus::RequiresAction {
                let mut attachment = Attachment::default();
                let step = self
                    .handle_required_action(&polled, &mut attachment, turn, cancel)
                    .await;
                self.close_attachment(&mut attachment);
                return step;
            }
        }

        Err(OrchestratorError::Timeout { attempts })
    }

    fn settle(&self, run: &Run) -> Step {
        if matches!(
            run.status,
            RunStatus::Failed | RunStatus::Expired | RunStatus::Incomplete
        ) {
            let detail = run
                .last_error
                .as_ref()
                .map(|e| e.message.as_str())
                .unwrap_or("no details");
            self.notice(format!("Run {}: {detail}", run.status));
        }
        Step::Terminal(run.status)
    }

    /// Execute the whole pending batch and submit every output at once.
    async fn handle_required_action(
        &self,
        run: &Run,
        attachment: &mut Attachment,
        turn: &mut Turn,
        cancel: &CancellationToken,
    ) -> Result<Step, OrchestratorError> {
        if let Some(max) = self.settings.max_round_trips {
            if turn.round_trips >= max {
                return Ok(Step::IterationLimit);
            }
        }

        let calls = run.pending_tool_calls();
        let tools: Vec<Tool> = calls
            .iter()
            .map(|call| self.tools.resolve(&call.function.name))
            .collect::<Result<_, _>>()
            .map_err(OrchestratorError::ToolResolution)?;

        let mut outputs = Vec::with_capacity(calls.len());
        for (call, tool) in calls.iter().zip(tools) {
            let activity = self.open_activity(attachment, &call.id, ToolKind::Function);
            self.emit(UiEvent::SetActivityLanguage {
                activity_id: activity,
                language: ToolKind::Function.language().to_string(),
            });
            self.activity_token(activity, format!("Function Name: {}\n", call.function.name));
            self.activity_token(
                activity,
                format!("Function Arguments: {}\n\n", call.function.arguments),
            );

            let output = match self.tools.parse_arguments(tool, &call.function.arguments) {
                Ok(args) => match self.tools.execute(args).await {
                    Ok(result) => {
                        self.activity_token(activity, result.display_format);
                        result.json_format
                    }
                    Err(e) => {
                        warn!(tool = tool.name(), error = %e, "Tool execution failed");
                        self.activity_token(activity, e.to_string());
                        json!({ "error": e.to_string() }).to_string()
                    }
                },
                Err(e) => {
                    warn!(tool = tool.name(), error = %e, "Rejected tool arguments");
                    self.activity_token(activity, e.to_string());
                    self.notice(format!("An error occurred: {e}"));
                    json!({ "error": e.to_string(), "arguments": call.function.arguments })
                        .to_string()
                }
            };

            self.close_activity(attachment, &call.id);
            outputs.push(ToolOutput {
                tool_call_id: call.id.clone(),
                output,
            });
        }

        turn.round_trips += 1;
        info!(run_id = %run.id, outputs = outputs.len(), "Submitting tool outputs");
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Step::Cancelled),
            next = self.service.submit_tool_outputs_stream(&run.thread_id, &run.id, &outputs) => next?,
        };
        Ok(Step::Continue(next))
    }

    /// Cancel the remote run if it may still be active. Returns its id.
    async fn cancel_remote(&self, turn: &Turn) -> Option<String> {
        let run = turn.last_run.as_ref()?;
        if !run.status.is_terminal() {
            info!(run_id = %run.id, "Cancelling remote run");
            if let Err(e) = self.service.cancel_run(&run.thread_id, &run.id).await {
                warn!(run_id = %run.id, error = %e, "Failed to cancel run");
            }
        }
        Some(run.id.clone())
    }

    // --- text ---

    fn open_message(&self, attachment: &mut Attachment) -> Uuid {
        self.finalize_message(attachment);
        let id = Uuid::new_v4();
        self.emit(UiEvent::OpenMessage {
            message_id: id,
            author: self.settings.assistant_name.clone(),
        });
        attachment.message = Some(MessageProjection {
            id,
            text: String::new(),
            rewritten: false,
            finalized: false,
        });
        id
    }

    fn finalize_message(&self, attachment: &mut Attachment) {
        if let Some(message) = attachment.message.as_mut().filter(|m| !m.finalized) {
            message.finalized = true;
            self.emit(UiEvent::FinalizeMessage {
                message_id: message.id,
            });
        }
    }

    fn on_text_delta(&self, attachment: &mut Attachment, value: &str) {
        if value.is_empty() {
            return;
        }
        if attachment.message.as_ref().is_none_or(|m| m.finalized) {
            self.open_message(attachment);
        }
        let Some(message) = attachment.message.as_mut() else {
            return;
        };

        message.text.push_str(value);
        match self.sanitizer.rewrite(&message.text) {
            Some(text) => {
                message.rewritten = true;
                self.emit(UiEvent::ReplaceMessage {
                    message_id: message.id,
                    text,
                });
            }
            None if message.rewritten => {
                self.emit(UiEvent::ReplaceMessage {
                    message_id: message.id,
                    text: message.text.clone(),
                });
            }
            None => self.emit(UiEvent::AppendToken {
                message_id: message.id,
                token: value.to_string(),
            }),
        }
    }

    async fn on_text_done(
        &self,
        attachment: &mut Attachment,
        text: TextContent,
    ) -> Result<(), OrchestratorError> {
        let streamed_nothing = attachment
            .message
            .as_ref()
            .is_none_or(|m| m.finalized || m.text.is_empty());
        if streamed_nothing && !text.value.is_empty() {
            self.on_text_delta(attachment, &text.value);
        }
        self.finalize_message(attachment);

        for annotation in text.annotations {
            if let Annotation::FilePath { text, file_path } = annotation {
                let name = text.rsplit('/').next().unwrap_or(&text).to_string();
                let bytes = self.fetch_file(&file_path.file_id).await?;
                let message_id = self.element_target(attachment);
                self.emit(UiEvent::AttachElement {
                    message_id,
                    element: Element {
                        kind: ElementKind::File,
                        name,
                        bytes,
                    },
                });
            }
        }
        Ok(())
    }

    async fn on_image(&self, attachment: &mut Attachment, file_id: &str) -> Result<(), OrchestratorError> {
        let bytes = self.fetch_file(file_id).await?;
        let message_id = self.element_target(attachment);
        debug!(file_id, bytes = bytes.len(), "Attaching image");
        self.emit(UiEvent::AttachElement {
            message_id,
            element: Element {
                kind: ElementKind::Image,
                name: file_id.to_string(),
                bytes,
            },
        });
        Ok(())
    }

    /// The current message, or a new one if none was opened yet.
    fn element_target(&self, attachment: &mut Attachment) -> Uuid {
        match &attachment.message {
            Some(message) => message.id,
            None => self.open_message(attachment),
        }
    }

    async fn fetch_file(&self, file_id: &str) -> Result<Vec<u8>, OrchestratorError> {
        let bytes = self.service.get_file_content(file_id).await?;
        if !self.settings.retain_remote_files {
            if let Err(e) = self.service.delete_file(file_id).await {
                warn!(file_id, error = %e, "Failed to delete remote file");
            }
        }
        Ok(bytes)
    }

    // --- tool activity ---

    /// Open (or reuse) the activity for a tool call and make it current.
    fn open_activity(&self, attachment: &mut Attachment, call_id: &str, kind: ToolKind) -> Uuid {
        attachment.current_call = Some(call_id.to_string());
        if let Some(existing) = attachment.activities.get(call_id) {
            return existing.id;
        }

        let id = Uuid::new_v4();
        self.emit(UiEvent::OpenActivity {
            activity_id: id,
            name: kind.as_str().to_string(),
            language: kind.language().to_string(),
            started_at: Utc::now(),
        });
        attachment
            .activities
            .insert(call_id.to_string(), ActivityProjection { id, has_logs: false });
        id
    }

    fn on_tool_call_delta(
        &self,
        attachment: &mut Attachment,
        code_input: Option<String>,
        logs: Option<String>,
        snapshot: &ToolCallSnapshot,
    ) {
        if attachment.current_call.as_deref() != Some(snapshot.id.as_str()) {
            self.open_activity(attachment, &snapshot.id, snapshot.kind);
        }
        // Function arguments arrive whole with requires_action.
        if snapshot.kind != ToolKind::CodeInterpreter {
            return;
        }
        let Some(activity) = attachment.activities.get_mut(&snapshot.id) else {
            return;
        };

        if let Some(code) = code_input.filter(|c| !c.is_empty()) {
            self.activity_token(activity.id, code);
        }
        if let Some(logs) = logs.filter(|l| !l.is_empty()) {
            let token = if activity.has_logs {
                logs
            } else {
                activity.has_logs = true;
                format!("\n{logs}")
            };
            self.activity_token(activity.id, token);
        }
    }

    fn on_tool_call_done(&self, attachment: &mut Attachment, snapshot: &ToolCallSnapshot) {
        // Function calls stay open until their output is produced.
        if snapshot.kind != ToolKind::Function {
            self.close_activity(attachment, &snapshot.id);
        }
    }

    fn close_activity(&self, attachment: &mut Attachment, call_id: &str) {
        if let Some(activity) = attachment.activities.remove(call_id) {
            self.emit(UiEvent::CloseActivity {
                activity_id: activity.id,
                ended_at: Utc::now(),
            });
        }
        if attachment.current_call.as_deref() == Some(call_id) {
            attachment.current_call = None;
        }
    }

    fn close_attachment(&self, attachment: &mut Attachment) {
        self.finalize_message(attachment);
        let open: Vec<String> = attachment.activities.keys().cloned().collect();
        for call_id in open {
            self.close_activity(attachment, &call_id);
        }
    }

    // --- output ---

    fn emit(&self, event: UiEvent) {
        let _ = self.ui.send(event);
    }

    fn activity_token(&self, activity_id: Uuid, token: String) {
        self.emit(UiEvent::AppendActivityToken { activity_id, token });
    }

    fn notice(&self, text: String) {
        self.emit(UiEvent::Notice { text });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_config() {
        let config = Config::parse(
            r#"{
                service: { assistant_name: "Contoso Analyst" },
                run: { max_round_trips: 0, poll_attempts: 3, poll_interval_ms: 25, retain_remote_files: false },
            }"#,
        )
        .unwrap();
        let settings = OrchestratorSettings::from_config(&config);
        assert_eq!(settings.assistant_name, "Contoso Analyst");
        assert_eq!(settings.max_round_trips, None);
        assert_eq!(settings.poll_attempts, 3);
        assert_eq!(settings.poll_interval, Duration::from_millis(25));
        assert!(!settings.retain_remote_files);
    }

    #[test]
    fn test_default_settings_match_config_defaults() {
        let from_config = OrchestratorSettings::from_config(&Config::default());
        let default = OrchestratorSettings::default();
        assert_eq!(from_config.max_round_trips, default.max_round_trips);
        assert_eq!(from_config.poll_attempts, default.poll_attempts);
        assert_eq!(from_config.poll_interval, default.poll_interval);
        assert_eq!(from_config.retain_remote_files, default.retain_remote_files);
    }

    #[test]
    fn test_error_messages() {
        let err = OrchestratorError::ToolResolution(ToolError::UnknownTool("get_weather".into()));
        assert_eq!(err.to_string(), "unknown tool: get_weather");
        assert_eq!(
            OrchestratorError::Timeout { attempts: 3 }.to_string(),
            "run did not reach a terminal status after 3 status checks"
        );
    }
}
