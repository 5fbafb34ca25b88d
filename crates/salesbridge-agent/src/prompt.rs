//! Assistant instructions and one-time provisioning.

use anyhow::Context;
use tracing::info;

use salesbridge_core::config::Config;
use salesbridge_providers::{AssistantService, AssistantUpdate};
use salesbridge_tools::ToolRegistry;

/// Build the assistant's instructions around the database schema.
pub fn build_instructions(schema: &str) -> String {
    let parts = [
        "You are an advanced sales analysis assistant for Contoso. Your role is to be polite, \
         professional, helpful, and friendly while assisting users with their sales data inquiries."
            .to_string(),
        "You retrieve sales data using the ask_database tool in JSON format.".to_string(),
        format!("The sales data follows this SQLite schema: {schema}."),
        "If a user requests 'help,' provide a list of example questions you can assist with.".to_string(),
        "If a query is unrelated to sales or beyond your scope, respond with: 'I'm unable to assist \
         with that. Please contact IT for further help.'"
            .to_string(),
        "In case of aggressive or rude behavior, stay calm and professional. Respond with: 'I'm here \
         to help. Let's focus on your sales data inquiries. For other issues, please contact IT.'"
            .to_string(),
        "You have access to a sandboxed environment for writing and testing code.".to_string(),
        "Display data in table format unless a visualization is explicitly requested.".to_string(),
        "Ensure all visualizations and responses are in the same language as the user's question."
            .to_string(),
        "When you are asked to create a visualization you should follow these steps: \
         1. Write the necessary code. \
         2. Run the code to ensure it works. \
         3. If successful, display the visualization. \
         4. If unsuccessful, display the error, revise the code, and rerun it, following these steps again."
            .to_string(),
    ];
    parts.join(" ")
}

/// The remote assistant as configured for this process.
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantProfile {
    pub assistant_id: String,
    pub name: String,
    pub model: Option<String>,
}

impl AssistantProfile {
    /// Push name, model, instructions and tool declarations to the
    /// configured assistant.
    pub async fn provision(
        service: &dyn AssistantService,
        config: &Config,
        tools: &ToolRegistry,
    ) -> anyhow::Result<Self> {
        let service_config = config.service();
        let assistant_id = service_config
            .assistant_id
            .context("service.assistant_id is not configured")?;

        let store = tools.store().clone();
        let schema = tokio::task::spawn_blocking(move || store.schema_description())
            .await
            .context("schema task failed")??;

        let existing = service
            .retrieve_assistant(&assistant_id)
            .await
            .with_context(|| format!("retrieving assistant {assistant_id}"))?;

        let update = AssistantUpdate {
            name: config.assistant_name(),
            model: service_config.deployment,
            instructions: build_instructions(&schema),
            tools: tools.definitions(&schema),
        };
        let updated = service
            .update_assistant(&existing.id, &update)
            .await
            .with_context(|| format!("updating assistant {}", existing.id))?;

        info!(assistant_id = %updated.id, "Assistant provisioned");
        Ok(Self {
            assistant_id: updated.id,
            name: updated.name.unwrap_or(update.name),
            model: updated.model,
        })
    }
}
