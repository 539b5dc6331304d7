//! Folds decoded protocol events and stderr lines into an [`ExecutionResult`]

use std::collections::{HashMap, VecDeque};

use serde_json::Value;
use tracing::debug;

use crate::provider::{ProtocolEvent, StreamProtocol};
use crate::result::{ExecutionResult, RunnerEvent, ThinkingBlock, ToolEvent};
use crate::sanitize;

/// Tool result content kept in `tool_events` is capped to this many chars
pub(crate) const MAX_TOOL_RESULT_CHARS: usize = 5000;

pub(crate) struct Accumulator {
    protocol: Box<dyn StreamProtocol>,
    output: String,
    clean_parts: Vec<String>,
    result_text: Option<String>,
    cli_error: Option<String>,
    final_is_error: bool,
    cost_usd: f64,
    input_tokens: u64,
    output_tokens: u64,
    tool_events: Vec<ToolEvent>,
    thinking_blocks: Vec<ThinkingBlock>,
    stderr_lines: Vec<String>,
    /// Started tool calls by id
    tool_names: HashMap<String, String>,
    /// Calls without a matching result yet, oldest first
    open_calls: VecDeque<String>,
    last_tool_name: Option<String>,
    session_id: Option<String>,
    outbox: Vec<RunnerEvent>,
}

impl Accumulator {
    pub(crate) fn new(protocol: Box<dyn StreamProtocol>) -> Self {
        Self {
            protocol,
            output: String::new(),
            clean_parts: Vec::new(),
            result_text: None,
            cli_error: None,
            final_is_error: false,
            cost_usd: 0.0,
            input_tokens: 0,
            output_tokens: 0,
            tool_events: Vec::new(),
            thinking_blocks: Vec::new(),
            stderr_lines: Vec::new(),
            tool_names: HashMap::new(),
            open_calls: VecDeque::new(),
            last_tool_name: None,
            session_id: None,
            outbox: Vec::new(),
        }
    }

    /// Events produced since the last call, in arrival order
    pub(crate) fn drain_events(&mut self) -> Vec<RunnerEvent> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn push_stdout(&mut self, line: &str) {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) if value.is_object() => {
                for event in self.protocol.decode(value) {
                    self.apply(event);
                }
            }
            _ => self.append(&format!("{}\n", line)),
        }
    }

    pub(crate) fn push_stderr(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        self.stderr_lines.push(line.to_string());
        self.append(&format!("[LOG] {}\n", line));
    }

    fn append(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.output.push_str(chunk);
        self.outbox.push(RunnerEvent::Output(chunk.to_string()));
    }

    fn append_clean(&mut self, text: &str) {
        self.append(text);
        self.clean_parts.push(text.to_string());
    }

    fn apply(&mut self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::Log(text) => self.append(&text),
            ProtocolEvent::TextDelta(text) => self.append_clean(&text),
            ProtocolEvent::AssistantText {
                text,
                clean,
                thinking,
            } => {
                if clean {
                    self.append_clean(&text);
                }
                if thinking {
                    let block = ThinkingBlock { content: text };
                    self.outbox.push(RunnerEvent::Thinking(block.clone()));
                    self.thinking_blocks.push(block);
                }
            }
            ProtocolEvent::ToolStart { id, name, input } => {
                let rendered = self.protocol.render_tool_start(&name, &input);
                self.append(&rendered);
                if let Some(id) = &id {
                    self.tool_names.insert(id.clone(), name.clone());
                    self.open_calls.push_back(id.clone());
                }
                self.last_tool_name = Some(name.clone());
                let event = ToolEvent::ToolCall { id, name, input };
                self.outbox.push(RunnerEvent::ToolCall(event.clone()));
                self.tool_events.push(event);
            }
            ProtocolEvent::ToolResult {
                tool_use_id,
                name,
                content,
                is_error,
            } => {
                let name = name
                    .or_else(|| self.resolve_tool_name(tool_use_id.as_deref()))
                    .unwrap_or_else(|| "unknown".to_string());
                let content = sanitize::redact(&content);
                let rendered = self.protocol.render_tool_result(&name, &content, is_error);
                self.append(&rendered);
                let event = ToolEvent::ToolResult {
                    name,
                    content: content.chars().take(MAX_TOOL_RESULT_CHARS).collect(),
                    is_error,
                };
                self.outbox.push(RunnerEvent::ToolResult(event.clone()));
                self.tool_events.push(event);
            }
            ProtocolEvent::FinalResult {
                result,
                is_error,
                cost_usd,
                input_tokens,
                output_tokens,
            } => {
                self.final_is_error = is_error;
                if let Some(cost) = cost_usd {
                    self.cost_usd = cost;
                }
                if let Some(tokens) = input_tokens {
                    self.input_tokens = tokens;
                }
                if let Some(tokens) = output_tokens {
                    self.output_tokens = tokens;
                }
                match result.filter(|text| !text.is_empty()) {
                    Some(text) if is_error => self.cli_error = Some(text),
                    Some(text) => {
                        // Result text usually repeats what already streamed
                        if !self.output.contains(&text) {
                            self.append(&text);
                        }
                        self.result_text = Some(text);
                    }
                    None => {}
                }
            }
            ProtocolEvent::Session(id) => {
                debug!(session_id = %id, "Agent session reported");
                self.session_id = Some(id);
            }
        }
    }

    /// Matches by id first, then the oldest unanswered call, then the most
    /// recently started tool
    fn resolve_tool_name(&mut self, tool_use_id: Option<&str>) -> Option<String> {
        if let Some(id) = tool_use_id {
            if let Some(name) = self.tool_names.get(id).cloned() {
                self.open_calls.retain(|open| open != id);
                return Some(name);
            }
        }
        if let Some(id) = self.open_calls.pop_front() {
            return self.tool_names.get(&id).cloned();
        }
        self.last_tool_name.clone()
    }

    /// Finish with the reaped exit code; `-1` stands for a signal
    pub(crate) fn finish(self, exit_code: i32) -> ExecutionResult {
        let success = exit_code == 0 && !self.final_is_error;
        let error = if success {
            None
        } else {
            Some(self.resolve_error(exit_code))
        };
        let clean_output = match self.result_text {
            Some(text) => text,
            None => self.clean_parts.concat(),
        };

        ExecutionResult {
            success,
            output: self.output,
            clean_output,
            cost_usd: self.cost_usd,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            error,
            tool_events: self.tool_events,
            thinking_blocks: self.thinking_blocks,
            exit_code: Some(exit_code),
            session_id: self.session_id,
        }
    }

    /// Finish a run that was cut short
    pub(crate) fn abort(self, error: String) -> ExecutionResult {
        let clean_output = self.clean_parts.concat();
        ExecutionResult {
            success: false,
            output: self.output,
            clean_output,
            cost_usd: self.cost_usd,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            error: Some(error),
            tool_events: self.tool_events,
            thinking_blocks: self.thinking_blocks,
            exit_code: None,
            session_id: self.session_id,
        }
    }

    fn resolve_error(&self, exit_code: i32) -> String {
        if let Some(error) = &self.cli_error {
            return error.clone();
        }
        let stderr: Vec<&str> = self
            .stderr_lines
            .iter()
            .map(String::as_str)
            .filter(|line| !line.starts_with("[LOG]"))
            .collect();
        if !stderr.is_empty() {
            return format!("{}\n\n(Exit code: {})", stderr.join("\n"), exit_code);
        }
        if self.final_is_error {
            return "Agent reported an error".to_string();
        }
        format!("Exit code: {}", exit_code)
    }
}
