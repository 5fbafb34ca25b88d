//! Terminal rendering of UI events.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use tracing::warn;
use uuid::Uuid;

use salesbridge_agent::{ElementKind, UiEvent};

/// Writes the chat transcript as plain text. Activities render as fenced
/// blocks; attached files are saved under `downloads` and summarised.
pub struct TerminalRenderer<W: Write> {
    out: W,
    downloads: PathBuf,
    activities: HashMap<Uuid, String>,
}

impl<W: Write> TerminalRenderer<W> {
    pub fn new(out: W, downloads: PathBuf) -> Self {
        Self {
            out,
            downloads,
            activities: HashMap::new(),
        }
    }

    pub fn handle(&mut self, event: UiEvent) -> std::io::Result<()> {
        match event {
            UiEvent::OpenMessage { author, .. } => write!(self.out, "\n{author}: ")?,
            UiEvent::AppendToken { token, .. } => write!(self.out, "{token}")?,
            UiEvent::ReplaceMessage { text, .. } => write!(self.out, "\n(revised) {text}")?,
            UiEvent::FinalizeMessage { .. } => writeln!(self.out)?,
            UiEvent::AttachElement { element, .. } => {
                let label = match element.kind {
                    ElementKind::Image => "image",
                    ElementKind::File => "file",
                };
                match self.save(&element.name, &element.bytes) {
                    Some(path) => writeln!(
                        self.out,
                        "[{label}: {} ({} bytes) saved to {}]",
                        element.name,
                        element.bytes.len(),
                        path.display()
                    )?,
                    None => writeln!(
                        self.out,
                        "[{label}: {} ({} bytes)]",
                        element.name,
                        element.bytes.len()
                    )?,
                }
            }
            UiEvent::OpenActivity {
                activity_id,
                name,
                language,
                ..
            } => {
                write!(self.out, "\n[{name}]\n```{language}\n")?;
                self.activities.insert(activity_id, name);
            }
            UiEvent::SetActivityLanguage { .. } => {}
            UiEvent::AppendActivityToken { token, .. } => write!(self.out, "{token}")?,
            UiEvent::CloseActivity { activity_id, .. } => {
                if self.activities.remove(&activity_id).is_some() {
                    write!(self.out, "\n```\n")?;
                }
            }
            UiEvent::Notice { text } => writeln!(self.out, "\n! {text}")?,
        }
        self.out.flush()
    }

    fn save(&self, name: &str, bytes: &[u8]) -> Option<PathBuf> {
        // Names come from the service; keep only the final component.
        let file_name = std::path::Path::new(name).file_name()?;
        let path = self.downloads.join(file_name);
        let result = std::fs::create_dir_all(&self.downloads).and_then(|()| std::fs::write(&path, bytes));
        match result {
            Ok(()) => Some(path),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to save attachment");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use salesbridge_agent::Element;

    fn render(events: Vec<UiEvent>, downloads: PathBuf) -> String {
        let mut renderer = TerminalRenderer::new(Vec::new(), downloads);
        for event in events {
            renderer.handle(event).unwrap();
        }
        String::from_utf8(renderer.out).unwrap()
    }

    #[test]
    fn test_message_and_activity() {
        let message_id = Uuid::new_v4();
        let activity_id = Uuid::new_v4();
        let out = render(
            vec![
                UiEvent::OpenActivity {
                    activity_id,
                    name: "function".into(),
                    language: "sql".into(),
                    started_at: chrono_now(),
                },
                UiEvent::AppendActivityToken {
                    activity_id,
                    token: "Function Name: ask_database\n".into(),
                },
                UiEvent::CloseActivity {
                    activity_id,
                    ended_at: chrono_now(),
                },
                UiEvent::OpenMessage {
                    message_id,
                    author: "Sales Analysis Assistant".into(),
                },
                UiEvent::AppendToken {
                    message_id,
                    token: "Europe ".into(),
                },
                UiEvent::AppendToken {
                    message_id,
                    token: "leads.".into(),
                },
                UiEvent::FinalizeMessage { message_id },
                UiEvent::Notice {
                    text: "Run cancelled. run_1".into(),
                },
            ],
            PathBuf::from("/nonexistent"),
        );
        assert_eq!(
            out,
            "\n[function]\n```sql\nFunction Name: ask_database\n\n```\n\
             \nSales Analysis Assistant: Europe leads.\n\
             \n! Run cancelled. run_1\n"
        );
    }

    #[test]
    fn test_element_saved() {
        let dir = tempfile::tempdir().unwrap();
        let out = render(
            vec![UiEvent::AttachElement {
                message_id: Uuid::new_v4(),
                element: Element {
                    kind: ElementKind::File,
                    name: "../report.csv".into(),
                    bytes: b"a,b\n".to_vec(),
                },
            }],
            dir.path().to_path_buf(),
        );
        let saved = dir.path().join("report.csv");
        assert_eq!(std::fs::read(&saved).unwrap(), b"a,b\n");
        assert!(out.starts_with("[file: ../report.csv (4 bytes) saved to "));
    }

    fn chrono_now() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }
}
