//! Decoding of Assistants v2 streaming events.
//!
//! The service emits raw `thread.run.*`, `thread.run.step.*` and
//! `thread.message.*` events. [`EventAccumulator`] keeps per-stream
//! snapshots and turns them into the ordered [`StreamEvent`] union: text
//! blocks open, grow and close; tool calls open, grow and close; images
//! complete as soon as their content block appears.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use tracing::trace;

use salesbridge_core::types::{
    Annotation, FunctionCall, Run, StreamEvent, TextContent, ToolCallSnapshot, ToolKind,
};

// --- Raw payloads ---

#[derive(Debug, Deserialize)]
struct MessageDeltaEvent {
    id: String,
    delta: MessageDeltaBody,
}

#[derive(Debug, Default, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    content: Vec<ContentDelta>,
}

#[derive(Debug, Deserialize)]
struct ContentDelta {
    index: usize,
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: Option<TextDelta>,
    #[serde(default)]
    image_file: Option<ImageFile>,
}

#[derive(Debug, Deserialize)]
struct TextDelta {
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    annotations: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ImageFile {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct MessageObject {
    id: String,
    #[serde(default)]
    content: Vec<MessageContent>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: Option<TextContent>,
}

#[derive(Debug, Deserialize)]
struct RunStepDeltaEvent {
    id: String,
    delta: RunStepDeltaBody,
}

#[derive(Debug, Default, Deserialize)]
struct RunStepDeltaBody {
    #[serde(default)]
    step_details: Option<StepDetailsDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct StepDetailsDelta {
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<ToolKind>,
    #[serde(default)]
    code_interpreter: Option<CodeInterpreterDelta>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct CodeInterpreterDelta {
    #[serde(default)]
    input: Option<String>,
    #[serde(default)]
    outputs: Vec<CodeInterpreterOutput>,
}

#[derive(Debug, Deserialize)]
struct CodeInterpreterOutput {
    #[serde(rename = "type")]
    output_type: String,
    #[serde(default)]
    logs: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunStepObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEvent {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

// --- Accumulator ---

#[derive(Debug)]
struct OpenText {
    message_id: String,
    index: usize,
    text: TextContent,
}

#[derive(Debug)]
struct OpenCall {
    step_id: String,
    index: usize,
}

/// Stateful translator from raw service events to [`StreamEvent`]s.
#[derive(Debug, Default)]
pub struct EventAccumulator {
    seen_blocks: HashSet<(String, usize)>,
    open_text: Option<OpenText>,
    calls: HashMap<(String, usize), ToolCallSnapshot>,
    open_call: Option<OpenCall>,
}

impl EventAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one raw event. Returns the events it produces, in order.
    pub fn apply(&mut self, event: &str, data: &str) -> anyhow::Result<Vec<StreamEvent>> {
        let mut out = Vec::new();

        match event {
            "error" => {
                let parsed: ErrorEvent = serde_json::from_str(data).unwrap_or(ErrorEvent {
                    message: Some(data.to_string()),
                    error: None,
                });
                let message = parsed
                    .error
                    .and_then(|e| e.message)
                    .or(parsed.message)
                    .unwrap_or_else(|| "unknown error".to_string());
                anyhow::bail!("Assistant stream error: {message}");
            }
            "thread.message.delta" => {
                let delta: MessageDeltaEvent = serde_json::from_str(data)?;
                self.on_message_delta(delta, &mut out);
            }
            "thread.message.completed" | "thread.message.incomplete" => {
                let message: MessageObject = serde_json::from_str(data)?;
                self.on_message_done(message, &mut out);
            }
            "thread.run.step.delta" => {
                let delta: RunStepDeltaEvent = serde_json::from_str(data)?;
                self.on_step_delta(delta, &mut out);
            }
            "thread.run.step.completed"
            | "thread.run.step.failed"
            | "thread.run.step.cancelled"
            | "thread.run.step.expired" => {
                let step: RunStepObject = serde_json::from_str(data)?;
                self.close_call_for_step(&step.id, &mut out);
            }
            e if e.starts_with("thread.run.") && !e.starts_with("thread.run.step.") => {
                let run: Run = serde_json::from_str(data)?;
                out.push(StreamEvent::RunUpdated(run));
            }
            other => {
                trace!(event = other, "Ignoring stream event");
            }
        }

        Ok(out)
    }

    /// Flush whatever is still open when the stream ends.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        self.close_text(&mut out);
        self.close_call(&mut out);
        out
    }

    fn on_message_delta(&mut self, delta: MessageDeltaEvent, out: &mut Vec<StreamEvent>) {
        let message_id = delta.id;
        out.push(StreamEvent::MessageDelta {
            message_id: message_id.clone(),
            blocks: delta.delta.content.len(),
        });

        for block in delta.delta.content {
            let key = (message_id.clone(), block.index);
            if self.seen_blocks.insert(key) {
                self.close_text(out);
                match block.content_type.as_str() {
                    "text" => {
                        self.open_text = Some(OpenText {
                            message_id: message_id.clone(),
                            index: block.index,
                            text: TextContent::default(),
                        });
                        out.push(StreamEvent::TextCreated {
                            message_id: message_id.clone(),
                        });
                    }
                    "image_file" => {
                        if let Some(image) = &block.image_file {
                            out.push(StreamEvent::ImageFileDone {
                                file_id: image.file_id.clone(),
                            });
                        }
                    }
                    other => trace!(content_type = other, "Ignoring content block"),
                }
            }

            let Some(text_delta) = block.text else {
                continue;
            };
            let Some(open) = self.open_text.as_mut() else {
                continue;
            };
            if open.message_id != message_id || open.index != block.index {
                continue;
            }
            for raw in text_delta.annotations {
                if let Ok(annotation) = serde_json::from_value::<Annotation>(raw) {
                    open.text.annotations.push(annotation);
                }
            }
            if let Some(value) = text_delta.value {
                if !value.is_empty() {
                    open.text.value.push_str(&value);
                    out.push(StreamEvent::TextDelta {
                        message_id: message_id.clone(),
                        value,
                    });
                }
            }
        }
    }

    fn on_message_done(&mut self, message: MessageObject, out: &mut Vec<StreamEvent>) {
        let Some(open) = self.open_text.take() else {
            return;
        };
        if open.message_id != message.id {
            self.open_text = Some(open);
            return;
        }
        // Prefer the server's final rendering of the block when present.
        let text = message
            .content
            .into_iter()
            .nth(open.index)
            .filter(|c| c.content_type == "text")
            .and_then(|c| c.text)
            .unwrap_or(open.text);
        out.push(StreamEvent::TextDone {
            message_id: open.message_id,
            text,
        });
    }

    fn on_step_delta(&mut self, delta: RunStepDeltaEvent, out: &mut Vec<StreamEvent>) {
        let Some(details) = delta.delta.step_details else {
            return;
        };
        for call in details.tool_calls {
            let key = (delta.id.clone(), call.index);
            if !self.calls.contains_key(&key) {
                self.close_call(out);
                let kind = call.kind.unwrap_or(ToolKind::Function);
                let snapshot = ToolCallSnapshot {
                    id: call.id.clone().unwrap_or_default(),
                    kind,
                    code_input: String::new(),
                    logs: String::new(),
                    function: (kind == ToolKind::Function).then(FunctionCall::default),
                };
                out.push(StreamEvent::ToolCallCreated(snapshot.clone()));
                self.calls.insert(key.clone(), snapshot);
                self.open_call = Some(OpenCall {
                    step_id: delta.id.clone(),
                    index: call.index,
                });
            }

            let Some(snapshot) = self.calls.get_mut(&key) else {
                continue;
            };
            if let Some(id) = &call.id {
                if snapshot.id.is_empty() {
                    snapshot.id = id.clone();
                }
            }

            let mut code_input = None;
            let mut logs = None;
            if let Some(ci) = call.code_interpreter {
                if let Some(input) = ci.input.filter(|i| !i.is_empty()) {
                    snapshot.code_input.push_str(&input);
                    code_input = Some(input);
                }
                let new_logs: String = ci
                    .outputs
                    .into_iter()
                    .filter(|o| o.output_type == "logs")
                    .filter_map(|o| o.logs)
                    .collect();
                if !new_logs.is_empty() {
                    snapshot.logs.push_str(&new_logs);
                    logs = Some(new_logs);
                }
            }
            if let Some(f) = call.function {
                let function = snapshot.function.get_or_insert_with(FunctionCall::default);
                if let Some(name) = f.name {
                    function.name.push_str(&name);
                }
                if let Some(arguments) = f.arguments {
                    function.arguments.push_str(&arguments);
                }
            }

            out.push(StreamEvent::ToolCallDelta {
                code_input,
                logs,
                snapshot: snapshot.clone(),
            });
        }
    }

    fn close_call_for_step(&mut self, step_id: &str, out: &mut Vec<StreamEvent>) {
        if self
            .open_call
            .as_ref()
            .is_some_and(|open| open.step_id == step_id)
        {
            self.close_call(out);
        }
    }

    fn close_call(&mut self, out: &mut Vec<StreamEvent>) {
        if let Some(open) = self.open_call.take() {
            if let Some(snapshot) = self.calls.get(&(open.step_id, open.index)) {
                out.push(StreamEvent::ToolCallDone(snapshot.clone()));
            }
        }
    }

    fn close_text(&mut self, out: &mut Vec<StreamEvent>) {
        if let Some(open) = self.open_text.take() {
            out.push(StreamEvent::TextDone {
                message_id: open.message_id,
                text: open.text,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use salesbridge_core::types::RunStatus;

    fn apply(acc: &mut EventAccumulator, event: &str, data: serde_json::Value) -> Vec<StreamEvent> {
        acc.apply(event, &data.to_string()).unwrap()
    }

    fn text_delta(message_id: &str, index: usize, value: &str) -> serde_json::Value {
        serde_json::json!({
            "id": message_id,
            "object": "thread.message.delta",
            "delta": {"content": [{"index": index, "type": "text", "text": {"value": value}}]}
        })
    }

    #[test]
    fn test_text_lifecycle() {
        let mut acc = EventAccumulator::new();
        let first = apply(&mut acc, "thread.message.delta", text_delta("msg_1", 0, "Hel"));
        assert_eq!(
            first,
            vec![
                StreamEvent::MessageDelta { message_id: "msg_1".into(), blocks: 1 },
                StreamEvent::TextCreated { message_id: "msg_1".into() },
                StreamEvent::TextDelta { message_id: "msg_1".into(), value: "Hel".into() },
            ]
        );

        let second = apply(&mut acc, "thread.message.delta", text_delta("msg_1", 0, "lo"));
        assert_eq!(second.len(), 2);
        assert!(matches!(&second[1], StreamEvent::TextDelta { value, .. } if value == "lo"));

        let done = apply(
            &mut acc,
            "thread.message.completed",
            serde_json::json!({
                "id": "msg_1",
                "content": [{"type": "text", "text": {"value": "Hello", "annotations": []}}]
            }),
        );
        assert_eq!(
            done,
            vec![StreamEvent::TextDone {
                message_id: "msg_1".into(),
                text: TextContent { value: "Hello".into(), annotations: vec![] },
            }]
        );
        assert!(acc.finish().is_empty());
    }

    #[test]
    fn test_new_block_closes_previous_text() {
        let mut acc = EventAccumulator::new();
        apply(&mut acc, "thread.message.delta", text_delta("msg_1", 0, "Chart:"));
        let events = apply(
            &mut acc,
            "thread.message.delta",
            serde_json::json!({
                "id": "msg_1",
                "delta": {"content": [{"index": 1, "type": "image_file", "image_file": {"file_id": "file-img"}}]}
            }),
        );
        assert!(matches!(&events[1], StreamEvent::TextDone { text, .. } if text.value == "Chart:"));
        assert_eq!(
            events[2],
            StreamEvent::ImageFileDone { file_id: "file-img".into() }
        );
    }

    #[test]
    fn test_annotations_accumulate() {
        let mut acc = EventAccumulator::new();
        apply(&mut acc, "thread.message.delta", text_delta("msg_1", 0, "Download "));
        apply(
            &mut acc,
            "thread.message.delta",
            serde_json::json!({
                "id": "msg_1",
                "delta": {"content": [{"index": 0, "type": "text", "text": {
                    "value": "here",
                    "annotations": [{"type": "file_path", "text": "sandbox:/mnt/data/out.csv",
                                     "file_path": {"file_id": "file-csv"}, "start_index": 9, "end_index": 13}]
                }}]}
            }),
        );
        let flushed = acc.finish();
        match &flushed[0] {
            StreamEvent::TextDone { text, .. } => {
                assert_eq!(text.value, "Download here");
                assert_eq!(text.annotations.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_code_interpreter_tool_call() {
        let mut acc = EventAccumulator::new();
        let created = apply(
            &mut acc,
            "thread.run.step.delta",
            serde_json::json!({
                "id": "step_1",
                "delta": {"step_details": {"type": "tool_calls", "tool_calls": [
                    {"index": 0, "id": "call_ci", "type": "code_interpreter",
                     "code_interpreter": {"input": "import pandas", "outputs": []}}
                ]}}
            }),
        );
        assert!(matches!(&created[0], StreamEvent::ToolCallCreated(s) if s.id == "call_ci" && s.kind == ToolKind::CodeInterpreter));
        assert!(matches!(&created[1], StreamEvent::ToolCallDelta { code_input: Some(c), .. } if c == "import pandas"));

        let more = apply(
            &mut acc,
            "thread.run.step.delta",
            serde_json::json!({
                "id": "step_1",
                "delta": {"step_details": {"type": "tool_calls", "tool_calls": [
                    {"index": 0, "type": "code_interpreter",
                     "code_interpreter": {"input": " as pd", "outputs": [{"index": 0, "type": "logs", "logs": "ok"}]}}
                ]}}
            }),
        );
        match &more[0] {
            StreamEvent::ToolCallDelta { code_input, logs, snapshot } => {
                assert_eq!(code_input.as_deref(), Some(" as pd"));
                assert_eq!(logs.as_deref(), Some("ok"));
                assert_eq!(snapshot.code_input, "import pandas as pd");
                assert_eq!(snapshot.id, "call_ci");
            }
            other => panic!("unexpected {other:?}"),
        }

        let done = apply(
            &mut acc,
            "thread.run.step.completed",
            serde_json::json!({"id": "step_1", "object": "thread.run.step", "status": "completed"}),
        );
        assert!(matches!(&done[0], StreamEvent::ToolCallDone(s) if s.code_input == "import pandas as pd"));
    }

    #[test]
    fn test_function_tool_call_arguments_accumulate() {
        let mut acc = EventAccumulator::new();
        apply(
            &mut acc,
            "thread.run.step.delta",
            serde_json::json!({
                "id": "step_2",
                "delta": {"step_details": {"type": "tool_calls", "tool_calls": [
                    {"index": 0, "id": "call_fn", "type": "function",
                     "function": {"name": "ask_database", "arguments": "{\"query\":"}}
                ]}}
            }),
        );
        let events = apply(
            &mut acc,
            "thread.run.step.delta",
            serde_json::json!({
                "id": "step_2",
                "delta": {"step_details": {"type": "tool_calls", "tool_calls": [
                    {"index": 0, "type": "function", "function": {"arguments": "\"SELECT 1\"}"}}
                ]}}
            }),
        );
        match &events[0] {
            StreamEvent::ToolCallDelta { snapshot, .. } => {
                let f = snapshot.function.as_ref().unwrap();
                assert_eq!(f.name, "ask_database");
                assert_eq!(f.arguments, r#"{"query":"SELECT 1"}"#);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_second_call_closes_first() {
        let mut acc = EventAccumulator::new();
        apply(
            &mut acc,
            "thread.run.step.delta",
            serde_json::json!({"id": "step_1", "delta": {"step_details": {"tool_calls": [
                {"index": 0, "id": "call_a", "type": "code_interpreter", "code_interpreter": {"input": "a"}}
            ]}}}),
        );
        let events = apply(
            &mut acc,
            "thread.run.step.delta",
            serde_json::json!({"id": "step_2", "delta": {"step_details": {"tool_calls": [
                {"index": 0, "id": "call_b", "type": "code_interpreter", "code_interpreter": {"input": "b"}}
            ]}}}),
        );
        assert!(matches!(&events[0], StreamEvent::ToolCallDone(s) if s.id == "call_a"));
        assert!(matches!(&events[1], StreamEvent::ToolCallCreated(s) if s.id == "call_b"));
    }

    #[test]
    fn test_run_events() {
        let mut acc = EventAccumulator::new();
        let events = apply(
            &mut acc,
            "thread.run.completed",
            serde_json::json!({"id": "run_1", "thread_id": "thread_1", "status": "completed"}),
        );
        match &events[0] {
            StreamEvent::RunUpdated(run) => assert_eq!(run.status, RunStatus::Completed),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_error_event_is_err() {
        let mut acc = EventAccumulator::new();
        let err = acc
            .apply("error", r#"{"error": {"message": "rate limited"}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("rate limited"));
    }

    #[test]
    fn test_unknown_events_ignored() {
        let mut acc = EventAccumulator::new();
        assert!(acc.apply("thread.created", "{}").unwrap().is_empty());
        assert!(acc.apply("thread.run.step.created", "{}").unwrap().is_empty());
    }
}
