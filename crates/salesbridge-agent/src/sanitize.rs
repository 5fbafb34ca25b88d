//! Display policies applied to streamed assistant text.

use std::sync::LazyLock;

use regex::Regex;

static MARKDOWN_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[(.*?)\]\s*\(\s*.*?\s*\)").expect("markdown link pattern is valid")
});

/// Rewrites the text of a message while it streams.
///
/// Returning `Some(text)` replaces the whole displayed message with `text`
/// instead of appending the latest delta.
pub trait OutputSanitizer: Send + Sync {
    fn rewrite(&self, snapshot: &str) -> Option<String>;
}

/// Streams text unchanged.
pub struct Passthrough;

impl OutputSanitizer for Passthrough {
    fn rewrite(&self, _snapshot: &str) -> Option<String> {
        None
    }
}

/// Replaces `[label](target)` with `label`. Sandbox links the assistant
/// emits for generated files are not reachable from the chat surface.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkdownLinkStripper;

impl MarkdownLinkStripper {
    pub fn new() -> Self {
        Self
    }
}

impl OutputSanitizer for MarkdownLinkStripper {
    fn rewrite(&self, snapshot: &str) -> Option<String> {
        if !MARKDOWN_LINK.is_match(snapshot) {
            return None;
        }
        Some(MARKDOWN_LINK.replace_all(snapshot, "$1").into_owned())
    }
}
