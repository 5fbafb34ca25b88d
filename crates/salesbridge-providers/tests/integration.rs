//! Assistants API integration tests: real API calls.
//!
//! Skipped unless `AZURE_OPENAI_KEY` and `AZURE_OPENAI_ENDPOINT` are set.
//! Run with: `cargo test -p salesbridge-providers --test integration`

use salesbridge_providers::assistants::AssistantsClient;
use salesbridge_providers::{AssistantService, MessageRole};

fn azure_client() -> Option<AssistantsClient> {
    let key = std::env::var("AZURE_OPENAI_KEY").ok().filter(|k| !k.is_empty())?;
    let endpoint = std::env::var("AZURE_OPENAI_ENDPOINT")
        .ok()
        .filter(|e| !e.is_empty())?;
    Some(AssistantsClient::azure(&endpoint, "2024-05-01-preview", &key))
}

#[tokio::test]
async fn test_thread_lifecycle() {
    let Some(client) = azure_client() else {
        eprintln!("Skipping: AZURE_OPENAI_KEY / AZURE_OPENAI_ENDPOINT not set");
        return;
    };

    let thread_id = client.create_thread().await.expect("create thread");
    assert!(!thread_id.is_empty());

    let message_id = client
        .append_message(&thread_id, MessageRole::User, "What regions do we sell in?")
        .await
        .expect("append message");
    assert!(!message_id.is_empty());

    client.delete_thread(&thread_id).await.expect("delete thread");
}

#[tokio::test]
async fn test_bad_key_is_rejected() {
    let Ok(endpoint) = std::env::var("AZURE_OPENAI_ENDPOINT") else {
        eprintln!("Skipping: AZURE_OPENAI_ENDPOINT not set");
        return;
    };
    if endpoint.is_empty() {
        return;
    }

    let client = AssistantsClient::azure(&endpoint, "2024-05-01-preview", "invalid-key");
    let err = client.create_thread().await.unwrap_err();
    assert!(err.to_string().contains("Assistants API error"));
}
