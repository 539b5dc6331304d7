//! Vendor stream protocols
//!
//! Each provider knows how to launch its CLI and how to decode one stdout
//! JSON line into zero or more [`ProtocolEvent`]s. Decoding goes through a
//! closed set of serde variants per provider; anything else is logged and
//! ignored.

mod claude;
mod cursor;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RunnerError};

pub use claude::ClaudeProtocol;
pub use cursor::CursorProtocol;

/// Supported agent CLIs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    Claude,
    Cursor,
}

impl ProviderKind {
    /// Parse provider from string
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "claude" | "claude-code" => Ok(Self::Claude),
            "cursor" | "cursor-agent" => Ok(Self::Cursor),
            _ => Err(RunnerError::InvalidProvider {
                name: s.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Cursor => "cursor",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Claude => "Claude",
            Self::Cursor => "Cursor",
        }
    }

    pub(crate) fn protocol(&self) -> Box<dyn StreamProtocol> {
        match self {
            Self::Claude => Box::new(ClaudeProtocol::default()),
            Self::Cursor => Box::new(CursorProtocol::default()),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run knobs passed through to the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderOptions {
    pub model: Option<String>,
    /// Named agent/persona; takes precedence over `model` where both exist
    pub agent: Option<String>,
    pub allowed_tools: Option<String>,
    /// `Some("")` enables debug output without a category filter
    pub debug: Option<String>,
    pub mcp_config: Option<PathBuf>,
    /// Cursor mode: `agent`, `plan` or `ask`
    pub mode: Option<String>,
    /// Skip interactive permission prompts
    #[serde(default = "default_true")]
    pub force: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            model: None,
            agent: None,
            allowed_tools: None,
            debug: None,
            mcp_config: None,
            mode: None,
            force: true,
        }
    }
}

/// A decoded protocol line, provider independent
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ProtocolEvent {
    /// Informational text for the full output only
    Log(String),
    /// Incremental assistant text; always clean
    TextDelta(String),
    /// A whole assistant message
    AssistantText {
        text: String,
        /// Counts towards the clean output
        clean: bool,
        /// Recorded as a thinking block
        thinking: bool,
    },
    ToolStart {
        id: Option<String>,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: Option<String>,
        name: Option<String>,
        content: String,
        is_error: bool,
    },
    FinalResult {
        result: Option<String>,
        is_error: bool,
        cost_usd: Option<f64>,
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
    },
    Session(String),
}

pub(crate) trait StreamProtocol: Send {
    fn kind(&self) -> ProviderKind;

    /// Executable name looked up on `PATH`
    fn program(&self) -> &'static str;

    fn args(&self, prompt: &str, options: &ProviderOptions) -> Vec<String>;

    fn env(&self, task_id: &str) -> Vec<(&'static str, String)>;

    /// Decode one parsed stdout line
    fn decode(&mut self, line: Value) -> Vec<ProtocolEvent>;

    /// Annotation appended to the output when a tool starts
    fn render_tool_start(&self, name: &str, input: &Value) -> String;

    /// Annotation appended to the output when a tool returns; `content` is
    /// already redacted
    fn render_tool_result(&self, name: &str, content: &str, is_error: bool) -> String;
}

/// Flatten tool result content that may be a string, a list of text parts or
/// arbitrary JSON
pub(crate) fn content_to_text(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .map(|part| match part.get("text").and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => content_to_text(part),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_provider_from_str() {
        assert_eq!(ProviderKind::parse("claude").unwrap(), ProviderKind::Claude);
        assert_eq!(ProviderKind::parse("Cursor").unwrap(), ProviderKind::Cursor);
        assert!(ProviderKind::parse("unknown").is_err());
    }

    #[test]
    fn test_content_to_text() {
        assert_eq!(content_to_text(&json!("plain")), "plain");
        assert_eq!(
            content_to_text(&json!([{"type": "text", "text": "a"}, {"type": "text", "text": "b"}])),
            "a\nb"
        );
        assert_eq!(content_to_text(&json!({"id": 5})), "{\"id\":5}");
    }
}
