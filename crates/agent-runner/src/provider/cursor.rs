//! Cursor-style stream-json protocol
//!
//! Emits whole `assistant` messages, discrete `tool_call` started/completed
//! events wrapping one typed tool-call object, and a closing `result`.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{content_to_text, ProtocolEvent, ProviderKind, ProviderOptions, StreamProtocol};

const RESULT_PREVIEW_CHARS: usize = 500;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Line {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        message: Message,
    },
    ToolCall {
        subtype: Phase,
        #[serde(default)]
        call_id: Option<String>,
        tool_call: ToolCall,
    },
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Vec<Block>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Block {
    Text {
        #[serde(default)]
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Phase {
    Started,
    Completed,
}

/// The known tool-call shapes; the wrapping key names the tool
#[derive(Debug, Deserialize)]
enum ToolCall {
    #[serde(rename = "shellToolCall")]
    Shell(ToolBody),
    #[serde(rename = "readToolCall")]
    Read(ToolBody),
    #[serde(rename = "editToolCall")]
    Edit(ToolBody),
    #[serde(rename = "writeToolCall")]
    Write(ToolBody),
    #[serde(rename = "deleteToolCall")]
    Delete(ToolBody),
    #[serde(rename = "grepToolCall")]
    Grep(ToolBody),
    #[serde(rename = "globToolCall")]
    Glob(ToolBody),
    #[serde(rename = "lsToolCall")]
    Ls(ToolBody),
    #[serde(rename = "todoToolCall", alias = "updateTodosToolCall")]
    Todo(ToolBody),
    #[serde(rename = "webSearchToolCall")]
    WebSearch(ToolBody),
    #[serde(rename = "mcpToolCall")]
    Mcp(ToolBody),
}

#[derive(Debug, Default, Deserialize)]
struct ToolBody {
    #[serde(default)]
    args: Value,
    #[serde(default)]
    result: Option<ToolOutcome>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ToolOutcome {
    Success(Value),
    Error(Value),
}

impl ToolCall {
    fn parts(&self) -> (&'static str, &ToolBody) {
        match self {
            Self::Shell(b) => ("shell", b),
            Self::Read(b) => ("read", b),
            Self::Edit(b) => ("edit", b),
            Self::Write(b) => ("write", b),
            Self::Delete(b) => ("delete", b),
            Self::Grep(b) => ("grep", b),
            Self::Glob(b) => ("glob", b),
            Self::Ls(b) => ("ls", b),
            Self::Todo(b) => ("todo", b),
            Self::WebSearch(b) => ("web_search", b),
            Self::Mcp(b) => ("mcp", b),
        }
    }

    /// MCP calls are named after the remote tool they invoke
    fn name(&self) -> String {
        let (kind, body) = self.parts();
        if let Self::Mcp(_) = self {
            for key in ["toolName", "name"] {
                if let Some(name) = body.args.get(key).and_then(Value::as_str) {
                    return name.to_string();
                }
            }
        }
        kind.to_string()
    }

    fn input(&self) -> Value {
        let (_, body) = self.parts();
        if let (Self::Mcp(_), Some(args)) = (self, body.args.get("args")) {
            return args.clone();
        }
        body.args.clone()
    }

    fn outcome(&self) -> Option<(String, bool)> {
        match &self.parts().1.result {
            Some(ToolOutcome::Success(value)) => {
                let text = match value.get("content") {
                    Some(content) => content_to_text(content),
                    None => content_to_text(value),
                };
                Some((text, false))
            }
            Some(ToolOutcome::Error(value)) => {
                Some((format!("Error: {}", content_to_text(value)), true))
            }
            None => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct CursorProtocol {
    saw_assistant_text: bool,
}

impl StreamProtocol for CursorProtocol {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cursor
    }

    fn program(&self) -> &'static str {
        "agent"
    }

    fn args(&self, prompt: &str, options: &ProviderOptions) -> Vec<String> {
        let mut args: Vec<String> = ["-p", "--output-format", "stream-json"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if options.force {
            args.push("-f".to_string());
        }
        if let Some(model) = &options.model {
            args.extend(["-m".to_string(), model.clone()]);
        }
        if let Some(mode) = options
            .mode
            .as_deref()
            .filter(|m| matches!(*m, "agent" | "plan" | "ask"))
        {
            args.extend(["--mode".to_string(), mode.to_string()]);
        }
        args.push(prompt.to_string());
        args
    }

    fn env(&self, task_id: &str) -> Vec<(&'static str, String)> {
        vec![("CURSOR_TASK_ID", task_id.to_string())]
    }

    fn decode(&mut self, line: Value) -> Vec<ProtocolEvent> {
        let line: Line = match serde_json::from_value(line) {
            Ok(line) => line,
            Err(e) => {
                debug!("Ignoring undecodable cursor line: {}", e);
                return Vec::new();
            }
        };

        match line {
            Line::System {
                subtype,
                model,
                session_id,
            } => {
                let mut events: Vec<ProtocolEvent> =
                    session_id.map(ProtocolEvent::Session).into_iter().collect();
                if subtype.as_deref() == Some("init") {
                    events.push(ProtocolEvent::Log(format!(
                        "[INIT] Session started with model: {}\n",
                        model.as_deref().unwrap_or("unknown")
                    )));
                }
                events
            }
            Line::Assistant { message } => message
                .content
                .into_iter()
                .filter_map(|block| match block {
                    Block::Text { text } if !text.is_empty() => {
                        self.saw_assistant_text = true;
                        Some(ProtocolEvent::AssistantText {
                            text,
                            clean: true,
                            thinking: false,
                        })
                    }
                    _ => None,
                })
                .collect(),
            Line::ToolCall {
                subtype: Phase::Started,
                call_id,
                tool_call,
            } => vec![ProtocolEvent::ToolStart {
                id: call_id,
                name: tool_call.name(),
                input: tool_call.input(),
            }],
            Line::ToolCall {
                subtype: Phase::Completed,
                call_id,
                tool_call,
            } => match tool_call.outcome() {
                Some((content, is_error)) if !content.is_empty() => {
                    vec![ProtocolEvent::ToolResult {
                        tool_use_id: call_id,
                        name: Some(tool_call.name()),
                        content,
                        is_error,
                    }]
                }
                _ => Vec::new(),
            },
            Line::Result {
                result,
                is_error,
                duration_ms,
                session_id,
            } => {
                debug!(?duration_ms, is_error, "Cursor run finished");
                let mut events: Vec<ProtocolEvent> =
                    session_id.map(ProtocolEvent::Session).into_iter().collect();
                events.push(ProtocolEvent::FinalResult {
                    result,
                    is_error,
                    cost_usd: None,
                    input_tokens: None,
                    output_tokens: None,
                });
                events
            }
            Line::Unknown => Vec::new(),
        }
    }

    fn render_tool_start(&self, name: &str, _input: &Value) -> String {
        format!("\n[TOOL] Starting: {}\n", name)
    }

    fn render_tool_result(&self, name: &str, content: &str, _is_error: bool) -> String {
        let preview: String = content.chars().take(RESULT_PREVIEW_CHARS).collect();
        format!("[TOOL RESULT] {}: {}\n", name, preview)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_args() {
        let protocol = CursorProtocol::default();
        let options = ProviderOptions {
            model: Some("gpt-5".to_string()),
            mode: Some("yolo".to_string()),
            ..Default::default()
        };
        let args = protocol.args("fix it", &options);
        assert_eq!(
            args,
            vec!["-p", "--output-format", "stream-json", "-f", "-m", "gpt-5", "fix it"]
        );
    }

    #[test]
    fn test_init_line() {
        let mut protocol = CursorProtocol::default();
        let events = protocol.decode(json!({"type": "system", "subtype": "init", "model": "sonnet", "session_id": "s-1"}));
        assert_eq!(
            events,
            vec![
                ProtocolEvent::Session("s-1".to_string()),
                ProtocolEvent::Log("[INIT] Session started with model: sonnet\n".to_string())
            ]
        );
    }

    #[test]
    fn test_shell_tool_lifecycle() {
        let mut protocol = CursorProtocol::default();
        let started = json!({"type": "tool_call", "subtype": "started", "call_id": "c1",
            "tool_call": {"shellToolCall": {"args": {"command": "ls"}}}});
        assert_eq!(
            protocol.decode(started),
            vec![ProtocolEvent::ToolStart {
                id: Some("c1".to_string()),
                name: "shell".to_string(),
                input: json!({"command": "ls"})
            }]
        );

        let completed = json!({"type": "tool_call", "subtype": "completed", "call_id": "c1",
            "tool_call": {"shellToolCall": {"args": {"command": "ls"},
                "result": {"success": {"content": "README.md"}}}}});
        assert_eq!(
            protocol.decode(completed),
            vec![ProtocolEvent::ToolResult {
                tool_use_id: Some("c1".to_string()),
                name: Some("shell".to_string()),
                content: "README.md".to_string(),
                is_error: false
            }]
        );
    }

    #[test]
    fn test_mcp_tool_is_named_after_remote_tool() {
        let mut protocol = CursorProtocol::default();
        let started = json!({"type": "tool_call", "subtype": "started",
            "tool_call": {"mcpToolCall": {"args": {"toolName": "add_issue_comment", "args": {"body": "LGTM"}}}}});
        match &protocol.decode(started)[0] {
            ProtocolEvent::ToolStart { name, input, .. } => {
                assert_eq!(name, "add_issue_comment");
                assert_eq!(input["body"], "LGTM");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_result() {
        let mut protocol = CursorProtocol::default();
        let completed = json!({"type": "tool_call", "subtype": "completed",
            "tool_call": {"readToolCall": {"result": {"error": "no such file"}}}});
        match &protocol.decode(completed)[0] {
            ProtocolEvent::ToolResult {
                content, is_error, ..
            } => {
                assert_eq!(content, "Error: no such file");
                assert!(is_error);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tool_call_fails_closed() {
        let mut protocol = CursorProtocol::default();
        let line = json!({"type": "tool_call", "subtype": "started",
            "tool_call": {"teleportToolCall": {"args": {}}}});
        assert!(protocol.decode(line).is_empty());
    }

    #[test]
    fn test_render_truncates_result() {
        let protocol = CursorProtocol::default();
        let long = "x".repeat(800);
        let rendered = protocol.render_tool_result("read", &long, false);
        assert_eq!(rendered.len(), "[TOOL RESULT] read: \n".len() + 500);
    }
}
