//! Session coordinator: one remote thread and at most one run in flight
//! per conversation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OnceCell, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use salesbridge_core::config::Config;
use salesbridge_core::types::RunRef;
use salesbridge_providers::{AssistantService, MessageRole, RunOptions};
use salesbridge_tools::ToolRegistry;

use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::prompt::AssistantProfile;
use crate::sanitize::{MarkdownLinkStripper, OutputSanitizer, Passthrough};
use crate::{RunOutcome, UiEvent};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("conversation {0} already has a response in progress")]
    Busy(String),

    #[error("{0}")]
    Service(#[from] anyhow::Error),
}

struct ActiveTurn {
    turn_id: Uuid,
    cancel: CancellationToken,
    run: watch::Receiver<Option<RunRef>>,
}

#[derive(Default)]
struct Conversation {
    thread_id: Option<String>,
    active: Option<ActiveTurn>,
}

/// Releases a conversation's in-flight slot when the turn ends, including
/// when the submitting future is dropped part-way.
struct TurnSlot<'a> {
    conversations: &'a Mutex<HashMap<String, Conversation>>,
    conversation: &'a str,
    turn_id: Uuid,
}

impl Drop for TurnSlot<'_> {
    fn drop(&mut self) {
        let mut conversations = self.conversations.lock();
        let Some(entry) = conversations.get_mut(self.conversation) else {
            return;
        };
        if let Some(active) = entry.active.take_if(|a| a.turn_id == self.turn_id) {
            // Nothing drives the run any more.
            active.cancel.cancel();
        }
    }
}

pub struct SessionCoordinator {
    service: Arc<dyn AssistantService>,
    tools: Arc<ToolRegistry>,
    config: Arc<Config>,
    settings: OrchestratorSettings,
    sanitizer: Arc<dyn OutputSanitizer>,
    profile: OnceCell<AssistantProfile>,
    conversations: Mutex<HashMap<String, Conversation>>,
}

impl SessionCoordinator {
    pub fn new(
        service: Arc<dyn AssistantService>,
        tools: Arc<ToolRegistry>,
        config: Arc<Config>,
    ) -> Self {
        let sanitizer: Arc<dyn OutputSanitizer> = if config.strip_markdown_links() {
            Arc::new(MarkdownLinkStripper::new())
        } else {
            Arc::new(Passthrough)
        };
        Self {
            service,
            tools,
            settings: OrchestratorSettings::from_config(&config),
            config,
            sanitizer,
            profile: OnceCell::new(),
            conversations: Mutex::new(HashMap::new()),
        }
    }

    /// Use an already provisioned assistant instead of provisioning lazily.
    pub fn with_profile(mut self, profile: AssistantProfile) -> Self {
        self.profile = OnceCell::new_with(Some(profile));
        self
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// The provisioned assistant, provisioning it on first use.
    pub async fn profile(&self) -> Result<&AssistantProfile, CoordinatorError> {
        let profile = self
            .profile
            .get_or_try_init(|| {
                AssistantProfile::provision(self.service.as_ref(), &self.config, &self.tools)
            })
            .await?;
        Ok(profile)
    }

    /// Create the conversation's thread up front. Returns the thread id.
    pub async fn start_session(&self, conversation: &str) -> Result<String, CoordinatorError> {
        self.profile().await?;
        if let Some(thread_id) = self.thread_id(conversation).await {
            return Ok(thread_id);
        }
        let thread_id = self.service.create_thread().await?;
        Ok(self.remember_thread(conversation, thread_id))
    }

    pub async fn thread_id(&self, conversation: &str) -> Option<String> {
        let conversations = self.conversations.lock();
        conversations.get(conversation)?.thread_id.clone()
    }

    /// Id of the run the in-flight turn is driving, if any.
    pub async fn current_run(&self, conversation: &str) -> Option<String> {
        let conversations = self.conversations.lock();
        let active = conversations.get(conversation)?.active.as_ref()?;
        let run = active.run.borrow();
        run.as_ref().map(|r| r.run_id.clone())
    }

    /// Whether a turn is in flight for the conversation.
    pub async fn is_busy(&self, conversation: &str) -> bool {
        let conversations = self.conversations.lock();
        conversations
            .get(conversation)
            .is_some_and(|c| c.active.is_some())
    }

    /// Send a user message and drive the resulting run to completion.
    ///
    /// Rejects the message with [`CoordinatorError::Busy`] while a previous
    /// turn for the same conversation is still running.
    pub async fn submit(
        &self,
        conversation: &str,
        text: &str,
        ui: mpsc::UnboundedSender<UiEvent>,
    ) -> Result<RunOutcome, CoordinatorError> {
        let (cancel, run_tx, thread_id, turn_id) = {
            let mut conversations = self.conversations.lock();
            let entry = conversations.entry(conversation.to_string()).or_default();
            if entry.active.is_some() {
                let _ = ui.send(UiEvent::Notice {
                    text: "A response is still in progress. Wait for it to finish or stop it first."
                        .to_string(),
                });
                return Err(CoordinatorError::Busy(conversation.to_string()));
            }
            let cancel = CancellationToken::new();
            let (run_tx, run_rx) = watch::channel(None);
            let turn_id = Uuid::new_v4();
            entry.active = Some(ActiveTurn {
                turn_id,
                cancel: cancel.clone(),
                run: run_rx,
            });
            (cancel, run_tx, entry.thread_id.clone(), turn_id)
        };
        let slot = TurnSlot {
            conversations: &self.conversations,
            conversation,
            turn_id,
        };

        let result = self
            .run_turn(conversation, thread_id, text, &ui, run_tx, &cancel)
            .await;
        drop(slot);

        if let Err(e) = &result {
            warn!(conversation, error = %e, "Turn failed before the run was driven");
            let _ = ui.send(UiEvent::Notice {
                text: format!("An error occurred: {e}"),
            });
            let _ = ui.send(UiEvent::Notice {
                text: "Please try again in a moment.".to_string(),
            });
        }
        result
    }

    async fn run_turn(
        &self,
        conversation: &str,
        thread_id: Option<String>,
        text: &str,
        ui: &mpsc::UnboundedSender<UiEvent>,
        run_tx: watch::Sender<Option<RunRef>>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, CoordinatorError> {
        let profile = self.profile().await?;

        let thread_id = match thread_id {
            Some(id) => id,
            None => {
                let created = self.service.create_thread().await?;
                self.remember_thread(conversation, created)
            }
        };

        self.service
            .append_message(&thread_id, MessageRole::User, text)
            .await?;

        let options = RunOptions {
            temperature: Some(self.config.temperature()),
            parallel_tool_calls: Some(self.config.parallel_tool_calls()),
            additional_instructions: None,
        };
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = ui.send(UiEvent::Notice { text: "Run cancelled.".to_string() });
                return Ok(RunOutcome::Cancelled);
            }
            stream = self.service.start_run_stream(&thread_id, &profile.assistant_id, &options) => stream?,
        };
        debug!(conversation, %thread_id, "Run started");

        let settings = OrchestratorSettings {
            assistant_name: profile.name.clone(),
            ..self.settings.clone()
        };
        let orchestrator = Orchestrator::new(self.service.clone(), self.tools.clone(), ui.clone(), settings)
            .with_sanitizer(self.sanitizer.clone())
            .with_run_ref(run_tx);

        let outcome = orchestrator.drive(stream, cancel).await;

        if outcome == RunOutcome::IterationLimit {
            // Free the thread for the next message.
            let run = orchestrator.run_updates().borrow().clone();
            if let Some(run) = run {
                if let Err(e) = self.service.cancel_run(&run.thread_id, &run.run_id).await {
                    warn!(run_id = %run.run_id, error = %e, "Failed to cancel run at ceiling");
                }
            }
        }

        info!(conversation, outcome = ?outcome, "Turn finished");
        Ok(outcome)
    }

    /// Stop the in-flight turn. Returns whether there was one.
    pub async fn stop(&self, conversation: &str) -> bool {
        let conversations = self.conversations.lock();
        match conversations.get(conversation).and_then(|c| c.active.as_ref()) {
            Some(active) => {
                info!(conversation, "Stop requested");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Forget the conversation and delete its thread. Never fails.
    pub async fn end_session(&self, conversation: &str) {
        let removed = self.conversations.lock().remove(conversation);
        let Some(removed) = removed else { return };

        if let Some(active) = &removed.active {
            active.cancel.cancel();
        }
        if let Some(thread_id) = removed.thread_id {
            match self.service.delete_thread(&thread_id).await {
                Ok(()) => debug!(conversation, %thread_id, "Thread deleted"),
                Err(e) => warn!(conversation, %thread_id, error = %e, "Error deleting thread"),
            }
        }
    }

    fn remember_thread(&self, conversation: &str, thread_id: String) -> String {
        let mut conversations = self.conversations.lock();
        let entry = conversations.entry(conversation.to_string()).or_default();
        entry.thread_id.get_or_insert(thread_id).clone()
    }
}
