//! Claude-style stream-json protocol
//!
//! Emits per-token `stream_event` deltas, whole `assistant` messages carrying
//! text and `tool_use` blocks, `user` messages carrying `tool_result` blocks,
//! and a closing `result` line with cost and usage.

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::debug;

use super::{content_to_text, ProtocolEvent, ProviderKind, ProviderOptions, StreamProtocol};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Line {
    Init {
        #[serde(default, deserialize_with = "null_as_default")]
        content: String,
    },
    System {
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        message: Message,
    },
    User {
        message: Message,
    },
    StreamEvent {
        event: StreamEvent,
    },
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default, deserialize_with = "null_as_default")]
        is_error: bool,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        cost_usd: Option<f64>,
        #[serde(default, deserialize_with = "null_as_default")]
        usage: Usage,
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
struct Message {
    #[serde(default, deserialize_with = "null_as_default")]
    content: MessageContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessageContent {
    Blocks(Vec<Block>),
    Text(String),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Block {
    Text {
        #[serde(default, deserialize_with = "null_as_default")]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        #[serde(default = "unknown_name")]
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: Option<String>,
        #[serde(default)]
        content: Value,
        #[serde(default, deserialize_with = "null_as_default")]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

/// Vendors send `null` for absent fields as often as they omit them
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn unknown_name() -> String {
    "unknown".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockDelta { delta: Delta },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta {
        #[serde(default, deserialize_with = "null_as_default")]
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

#[derive(Debug, Default)]
pub struct ClaudeProtocol {
    /// Set once any text delta streamed; whole assistant messages are then
    /// duplicates and only kept as thinking blocks
    streamed: bool,
}

impl StreamProtocol for ClaudeProtocol {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Claude
    }

    fn program(&self) -> &'static str {
        if cfg!(target_os = "windows") {
            "claude.cmd"
        } else {
            "claude"
        }
    }

    fn args(&self, prompt: &str, options: &ProviderOptions) -> Vec<String> {
        let mut args: Vec<String> = [
            "-p",
            "--output-format",
            "stream-json",
            "--verbose",
            "--include-partial-messages",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        if options.force {
            args.push("--dangerously-skip-permissions".to_string());
        }
        if let Some(agent) = &options.agent {
            args.extend(["--agent".to_string(), agent.clone()]);
        }
        match options.debug.as_deref() {
            Some("") => args.push("--debug".to_string()),
            Some(filter) => args.extend(["--debug".to_string(), filter.to_string()]),
            None => {}
        }
        if let (Some(model), None) = (&options.model, &options.agent) {
            args.extend(["--model".to_string(), model.clone()]);
        }
        if let Some(tools) = &options.allowed_tools {
            args.extend(["--allowedTools".to_string(), tools.clone()]);
        }
        if let Some(path) = options.mcp_config.as_ref().filter(|p| p.exists()) {
            args.extend([
                "--mcp-config".to_string(),
                path.to_string_lossy().into_owned(),
            ]);
        }

        args.push("--".to_string());
        args.push(prompt.to_string());
        args
    }

    fn env(&self, task_id: &str) -> Vec<(&'static str, String)> {
        vec![
            ("CLAUDE_TASK_ID", task_id.to_string()),
            ("CLAUDE_CODE_DISABLE_BACKGROUND_TASKS", "1".to_string()),
        ]
    }

    fn decode(&mut self, line: Value) -> Vec<ProtocolEvent> {
        let line: Line = match serde_json::from_value(line) {
            Ok(line) => line,
            Err(e) => {
                debug!("Ignoring undecodable claude line: {}", e);
                return Vec::new();
            }
        };

        match line {
            Line::Init { content } if !content.is_empty() => vec![ProtocolEvent::Log(content)],
            Line::Init { .. } | Line::Unknown => Vec::new(),
            Line::System { session_id } => {
                session_id.map(ProtocolEvent::Session).into_iter().collect()
            }
            Line::StreamEvent {
                event: StreamEvent::ContentBlockDelta { delta },
            } => {
                self.streamed = true;
                match delta {
                    Delta::TextDelta { text } if !text.is_empty() => {
                        vec![ProtocolEvent::TextDelta(text)]
                    }
                    _ => Vec::new(),
                }
            }
            Line::StreamEvent { .. } => Vec::new(),
            Line::Assistant { message } => self.decode_assistant(message),
            Line::User { message } => decode_user(message),
            Line::Result {
                result,
                is_error,
                total_cost_usd,
                cost_usd,
                usage,
                session_id,
            } => {
                let mut events: Vec<ProtocolEvent> =
                    session_id.map(ProtocolEvent::Session).into_iter().collect();
                events.push(ProtocolEvent::FinalResult {
                    result,
                    is_error,
                    cost_usd: total_cost_usd.or(cost_usd),
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                });
                events
            }
        }
    }

    fn render_tool_start(&self, name: &str, input: &Value) -> String {
        let mut log = format!("\n[TOOL] Using {}\n", name);
        if let Some(command) = input.get("command") {
            log.push_str(&format!("  Command: {}\n", value_text(command)));
        } else if let Some(description) = input.get("description") {
            log.push_str(&format!("  {}\n", value_text(description)));
        }
        log
    }

    fn render_tool_result(&self, _name: &str, content: &str, is_error: bool) -> String {
        if is_error {
            format!("[TOOL ERROR] {}\n", content)
        } else {
            format!("[TOOL RESULT]\n{}\n", content)
        }
    }
}

impl ClaudeProtocol {
    fn decode_assistant(&self, message: Message) -> Vec<ProtocolEvent> {
        let MessageContent::Blocks(blocks) = message.content else {
            return Vec::new();
        };
        blocks
            .into_iter()
            .filter_map(|block| match block {
                Block::Text { text } if !text.is_empty() => Some(ProtocolEvent::AssistantText {
                    text,
                    clean: !self.streamed,
                    thinking: true,
                }),
                Block::ToolUse { id, name, input } => {
                    Some(ProtocolEvent::ToolStart { id, name, input })
                }
                _ => None,
            })
            .collect()
    }
}

fn decode_user(message: Message) -> Vec<ProtocolEvent> {
    let MessageContent::Blocks(blocks) = message.content else {
        return Vec::new();
    };
    blocks
        .into_iter()
        .filter_map(|block| match block {
            Block::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let content = content_to_text(&content);
                (!content.is_empty()).then(|| ProtocolEvent::ToolResult {
                    tool_use_id: tool_use_id.filter(|id| !id.is_empty()),
                    name: None,
                    content,
                    is_error,
                })
            }
            _ => None,
        })
        .collect()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(protocol: &mut ClaudeProtocol, line: Value) -> Vec<ProtocolEvent> {
        protocol.decode(line)
    }

    #[test]
    fn test_args_prefer_agent_over_model() {
        let protocol = ClaudeProtocol::default();
        let options = ProviderOptions {
            model: Some("opus".to_string()),
            agent: Some("brain".to_string()),
            ..Default::default()
        };
        let args = protocol.args("do it", &options);

        assert!(args.contains(&"--agent".to_string()));
        assert!(!args.contains(&"--model".to_string()));
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert_eq!(&args[args.len() - 2..], ["--", "do it"]);
    }

    #[test]
    fn test_env_carries_task_id() {
        let env = ClaudeProtocol::default().env("t-1");
        assert!(env.contains(&("CLAUDE_TASK_ID", "t-1".to_string())));
        assert!(env.contains(&("CLAUDE_CODE_DISABLE_BACKGROUND_TASKS", "1".to_string())));
    }

    #[test]
    fn test_assistant_text_is_clean_until_streaming() {
        let mut protocol = ClaudeProtocol::default();
        let message = json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "Hi"}]}});

        assert_eq!(
            decode(&mut protocol, message.clone()),
            vec![ProtocolEvent::AssistantText {
                text: "Hi".to_string(),
                clean: true,
                thinking: true
            }]
        );

        let delta = json!({"type": "stream_event", "event": {"type": "content_block_delta", "delta": {"type": "text_delta", "text": "H"}}});
        assert_eq!(
            decode(&mut protocol, delta),
            vec![ProtocolEvent::TextDelta("H".to_string())]
        );

        match &decode(&mut protocol, message)[0] {
            ProtocolEvent::AssistantText { clean, .. } => assert!(!clean),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_tool_use_and_result() {
        let mut protocol = ClaudeProtocol::default();
        let call = json!({"type": "assistant", "message": {"content": [
            {"type": "tool_use", "id": "toolu_1", "name": "Bash", "input": {"command": "ls"}}
        ]}});
        assert_eq!(
            decode(&mut protocol, call),
            vec![ProtocolEvent::ToolStart {
                id: Some("toolu_1".to_string()),
                name: "Bash".to_string(),
                input: json!({"command": "ls"})
            }]
        );

        let result = json!({"type": "user", "message": {"content": [
            {"type": "tool_result", "tool_use_id": "toolu_1", "content": [{"type": "text", "text": "a.txt"}]}
        ]}});
        assert_eq!(
            decode(&mut protocol, result),
            vec![ProtocolEvent::ToolResult {
                tool_use_id: Some("toolu_1".to_string()),
                name: None,
                content: "a.txt".to_string(),
                is_error: false
            }]
        );
    }

    #[test]
    fn test_user_text_message_is_ignored() {
        let mut protocol = ClaudeProtocol::default();
        let line = json!({"type": "user", "message": {"content": "hello"}});
        assert!(decode(&mut protocol, line).is_empty());
    }

    #[test]
    fn test_result_line() {
        let mut protocol = ClaudeProtocol::default();
        let line = json!({"type": "result", "result": "Done", "is_error": false,
            "total_cost_usd": 0.12, "usage": {"input_tokens": 10, "output_tokens": 20}});
        assert_eq!(
            decode(&mut protocol, line),
            vec![ProtocolEvent::FinalResult {
                result: Some("Done".to_string()),
                is_error: false,
                cost_usd: Some(0.12),
                input_tokens: Some(10),
                output_tokens: Some(20)
            }]
        );
    }

    #[test]
    fn test_null_fields_are_tolerated() {
        let mut protocol = ClaudeProtocol::default();
        let line = json!({"type": "result", "result": "Done", "is_error": null,
            "usage": null, "total_cost_usd": null});
        assert_eq!(
            decode(&mut protocol, line),
            vec![ProtocolEvent::FinalResult {
                result: Some("Done".to_string()),
                is_error: false,
                cost_usd: None,
                input_tokens: None,
                output_tokens: None
            }]
        );

        let message = json!({"type": "assistant", "message": {"content": [
            {"type": "text", "text": null},
            {"type": "tool_use", "id": "toolu_2", "name": "Read", "input": {}}
        ]}});
        let events = decode(&mut protocol, message);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ProtocolEvent::ToolStart { name, .. } if name == "Read"));

        let delta = json!({"type": "stream_event", "event": {"type": "content_block_delta",
            "delta": {"type": "text_delta", "text": null}}});
        assert!(decode(&mut protocol, delta).is_empty());
    }

    #[test]
    fn test_unknown_and_malformed_lines_fail_closed() {
        let mut protocol = ClaudeProtocol::default();
        assert!(decode(&mut protocol, json!({"type": "telemetry", "x": 1})).is_empty());
        assert!(decode(&mut protocol, json!({"type": "assistant", "message": 5})).is_empty());
        assert!(decode(&mut protocol, json!([1, 2, 3])).is_empty());
    }

    #[test]
    fn test_render_tool_start() {
        let protocol = ClaudeProtocol::default();
        assert_eq!(
            protocol.render_tool_start("Bash", &json!({"command": "cargo fmt"})),
            "\n[TOOL] Using Bash\n  Command: cargo fmt\n"
        );
        assert_eq!(
            protocol.render_tool_start("Task", &json!({"description": "explore"})),
            "\n[TOOL] Using Task\n  explore\n"
        );
    }
}
