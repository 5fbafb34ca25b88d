//! Assistants v2 HTTP client.
//!
//! Implements [`AssistantService`] against Azure OpenAI
//! (`{endpoint}/openai/...?api-version=...`, `api-key` header) and OpenAI
//! (`https://api.openai.com/v1/...`, bearer token). Run streams are SSE
//! responses decoded through [`EventAccumulator`].

use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use salesbridge_core::config::{Config, ServiceStyle};
use salesbridge_core::types::{Run, StreamEvent, ToolOutput};

use crate::events::EventAccumulator;
use crate::sse::{SseEvent, parse_sse_stream};
use crate::{
    AssistantInfo, AssistantService, AssistantUpdate, EventStream, MessageRole, RunOptions,
};

const OPENAI_BASE_URL: &str = "https://api.openai.com";

pub struct AssistantsClient {
    pub base_url: String,
    pub style: ServiceStyle,
    api_version: String,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

impl AssistantsClient {
    pub fn azure(endpoint: &str, api_version: &str, api_key: &str) -> Self {
        Self {
            base_url: endpoint.trim_end_matches('/').to_string(),
            style: ServiceStyle::Azure,
            api_version: api_version.to_string(),
            api_key: api_key.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn openai(base_url: Option<&str>, api_key: &str) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            style: ServiceStyle::OpenAi,
            api_version: String::new(),
            api_key: api_key.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Build a client from the `service` config section.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let service = config.service();
        let api_key = service
            .resolve_api_key()
            .ok_or_else(|| anyhow::anyhow!("No API key configured for the assistant service"))?;

        match service.style {
            ServiceStyle::Azure => {
                let endpoint = config
                    .endpoint()
                    .ok_or_else(|| anyhow::anyhow!("service.endpoint is required for azure"))?;
                Ok(Self::azure(&endpoint, &config.api_version(), &api_key))
            }
            ServiceStyle::OpenAi => Ok(Self::openai(config.endpoint().as_deref(), &api_key)),
        }
    }

    /// Full URL for an API path such as `threads/{id}/runs`.
    pub fn url(&self, path: &str) -> String {
        match self.style {
            ServiceStyle::Azure => format!(
                "{}/openai/{}?api-version={}",
                self.base_url, path, self.api_version
            ),
            ServiceStyle::OpenAi => format!("{}/v1/{}", self.base_url, path),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, self.url(path))
            .header("OpenAI-Beta", "assistants=v2");

        match self.style {
            ServiceStyle::Azure => builder.header("api-key", &self.api_key),
            ServiceStyle::OpenAi => {
                builder.header("authorization", format!("Bearer {}", self.api_key))
            }
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> anyhow::Result<reqwest::Response> {
        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Assistants API error {status}: {body}");
        }
        Ok(response)
    }

    async fn open_stream(&self, path: &str, body: serde_json::Value) -> anyhow::Result<EventStream> {
        debug!(path, "Opening run stream");
        let response = self
            .send(
                self.request(reqwest::Method::POST, path)
                    .header("accept", "text/event-stream")
                    .json(&body),
            )
            .await?;
        Ok(run_event_stream(Box::pin(parse_sse_stream(response))))
    }
}

struct RunStreamState {
    sse: Pin<Box<dyn Stream<Item = anyhow::Result<SseEvent>> + Send>>,
    accumulator: EventAccumulator,
    pending: VecDeque<StreamEvent>,
    done: bool,
}

/// Turn an SSE stream of raw service events into a [`StreamEvent`] stream.
pub fn run_event_stream(
    sse: Pin<Box<dyn Stream<Item = anyhow::Result<SseEvent>> + Send>>,
) -> EventStream {
    let stream = futures::stream::unfold(
        RunStreamState {
            sse,
            accumulator: EventAccumulator::new(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((Ok(event), state));
                }
                if state.done {
                    return None;
                }

                match state.sse.next().await {
                    Some(Ok(sse_event)) => {
                        let data = sse_event.data.trim();
                        let name = sse_event.event.as_deref().unwrap_or("message");

                        // The stream terminates with "event: done / data: [DONE]"
                        if name == "done" || data == "[DONE]" {
                            state.pending.extend(state.accumulator.finish());
                            state.done = true;
                            continue;
                        }

                        match state.accumulator.apply(name, data) {
                            Ok(events) => state.pending.extend(events),
                            Err(e) => {
                                trace!(%e, event = name, "Run stream error event");
                                state.done = true;
                                return Some((Err(e), state));
                            }
                        }
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((Err(e), state));
                    }
                    None => {
                        state.pending.extend(state.accumulator.finish());
                        state.done = true;
                    }
                }
            }
        },
    );

    Box::pin(stream)
}

#[async_trait]
impl AssistantService for AssistantsClient {
    async fn create_thread(&self) -> anyhow::Result<String> {
        let response = self
            .send(self.request(reqwest::Method::POST, "threads").json(&json!({})))
            .await?;
        let thread: IdResponse = response.json().await?;
        debug!(thread_id = %thread.id, "Created thread");
        Ok(thread.id)
    }

    async fn delete_thread(&self, thread_id: &str) -> anyhow::Result<()> {
        self.send(self.request(reqwest::Method::DELETE, &format!("threads/{thread_id}")))
            .await?;
        debug!(thread_id, "Deleted thread");
        Ok(())
    }

    async fn append_message(
        &self,
        thread_id: &str,
        role: MessageRole,
        content: &str,
    ) -> anyhow::Result<String> {
        let response = self
            .send(
                self.request(reqwest::Method::POST, &format!("threads/{thread_id}/messages"))
                    .json(&json!({ "role": role, "content": content })),
            )
            .await?;
        let message: IdResponse = response.json().await?;
        Ok(message.id)
    }

    async fn start_run_stream(
        &self,
        thread_id: &str,
        assistant_id: &str,
        options: &RunOptions,
    ) -> anyhow::Result<EventStream> {
        let mut body = serde_json::to_value(options)?;
        body["assistant_id"] = json!(assistant_id);
        body["stream"] = json!(true);
        self.open_stream(&format!("threads/{thread_id}/runs"), body)
            .await
    }

    async fn submit_tool_outputs_stream(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> anyhow::Result<EventStream> {
        let body = json!({ "tool_outputs": outputs, "stream": true });
        self.open_stream(
            &format!("threads/{thread_id}/runs/{run_id}/submit_tool_outputs"),
            body,
        )
        .await
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> anyhow::Result<()> {
        self.send(self.request(
            reqwest::Method::POST,
            &format!("threads/{thread_id}/runs/{run_id}/cancel"),
        ))
        .await?;
        Ok(())
    }

    async fn get_run(&self, thread_id: &str, run_id: &str) -> anyhow::Result<Run> {
        let response = self
            .send(self.request(
                reqwest::Method::GET,
                &format!("threads/{thread_id}/runs/{run_id}"),
            ))
            .await?;
        Ok(response.json().await?)
    }

    async fn get_file_content(&self, file_id: &str) -> anyhow::Result<Vec<u8>> {
        let response = self
            .send(self.request(reqwest::Method::GET, &format!("files/{file_id}/content")))
            .await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn delete_file(&self, file_id: &str) -> anyhow::Result<()> {
        self.send(self.request(reqwest::Method::DELETE, &format!("files/{file_id}")))
            .await?;
        Ok(())
    }

    async fn retrieve_assistant(&self, assistant_id: &str) -> anyhow::Result<AssistantInfo> {
        let response = self
            .send(self.request(reqwest::Method::GET, &format!("assistants/{assistant_id}")))
            .await?;
        Ok(response.json().await?)
    }

    async fn update_assistant(
        &self,
        assistant_id: &str,
        update: &AssistantUpdate,
    ) -> anyhow::Result<AssistantInfo> {
        let response = self
            .send(
                self.request(reqwest::Method::POST, &format!("assistants/{assistant_id}"))
                    .json(update),
            )
            .await?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use salesbridge_core::types::RunStatus;

    fn sse(event: &str, data: serde_json::Value) -> anyhow::Result<SseEvent> {
        Ok(SseEvent {
            event: Some(event.into()),
            data: data.to_string(),
            id: None,
        })
    }

    #[test]
    fn test_azure_url() {
        let client = AssistantsClient::azure("https://contoso.openai.azure.com/", "2024-05-01-preview", "k");
        assert_eq!(
            client.url("threads/t1/runs"),
            "https://contoso.openai.azure.com/openai/threads/t1/runs?api-version=2024-05-01-preview"
        );
    }

    #[test]
    fn test_openai_url() {
        let client = AssistantsClient::openai(None, "k");
        assert_eq!(client.url("files/f1/content"), "https://api.openai.com/v1/files/f1/content");
        assert_eq!(client.style, ServiceStyle::OpenAi);
    }

    #[test]
    fn test_from_config_requires_endpoint_for_azure() {
        let config = Config::parse(r#"{ service: { style: "azure", api_key: "k" } }"#).unwrap();
        assert!(AssistantsClient::from_config(&config).is_err());

        let config = Config::parse(
            r#"{ service: { style: "azure", api_key: "k", endpoint: "https://x.openai.azure.com" } }"#,
        )
        .unwrap();
        let client = AssistantsClient::from_config(&config).unwrap();
        assert_eq!(client.base_url, "https://x.openai.azure.com");
    }

    #[tokio::test]
    async fn test_run_event_stream_flushes_on_done() {
        let raw = futures::stream::iter(vec![
            sse(
                "thread.run.created",
                json!({"id": "run_1", "thread_id": "t1", "status": "queued"}),
            ),
            sse(
                "thread.message.delta",
                json!({"id": "msg_1", "delta": {"content": [{"index": 0, "type": "text", "text": {"value": "Hi"}}]}}),
            ),
            Ok(SseEvent { event: Some("done".into()), data: "[DONE]".into(), id: None }),
        ]);
        let mut stream = run_event_stream(Box::pin(raw));
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event.unwrap());
        }
        assert!(matches!(&events[0], StreamEvent::RunUpdated(r) if r.status == RunStatus::Queued));
        assert!(matches!(events.last(), Some(StreamEvent::TextDone { text, .. }) if text.value == "Hi"));
    }

    #[tokio::test]
    async fn test_run_event_stream_surfaces_error_and_stops() {
        let raw = futures::stream::iter(vec![
            sse("error", json!({"error": {"message": "server overloaded"}})),
            sse(
                "thread.run.completed",
                json!({"id": "run_1", "thread_id": "t1", "status": "completed"}),
            ),
        ]);
        let mut stream = run_event_stream(Box::pin(raw));
        let first = stream.next().await.unwrap();
        assert!(first.unwrap_err().to_string().contains("server overloaded"));
        assert!(stream.next().await.is_none());
    }
}
