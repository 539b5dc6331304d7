//! Normalized outcome of one agent run

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool activity observed in the agent's stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolEvent {
    ToolCall {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        name: String,
        /// Redacted and capped content
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl ToolEvent {
    pub fn name(&self) -> &str {
        match self {
            Self::ToolCall { name, .. } | Self::ToolResult { name, .. } => name,
        }
    }
}

/// Whole assistant message emitted by the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingBlock {
    pub content: String,
}

/// Incremental notifications streamed to the caller while a run is live
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    /// A chunk of text, as appended to the accumulated output
    Output(String),
    ToolCall(ToolEvent),
    ToolResult(ToolEvent),
    Thinking(ThinkingBlock),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// Everything the run produced, tool and log annotations included, in
    /// arrival order
    pub output: String,
    /// Assistant-authored prose only
    pub clean_output: String,
    pub cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub error: Option<String>,
    pub tool_events: Vec<ToolEvent>,
    pub thinking_blocks: Vec<ThinkingBlock>,
    /// `None` when the process never ran; `-1` when it was killed by a signal
    pub exit_code: Option<i32>,
    pub session_id: Option<String>,
}

impl ExecutionResult {
    /// A run that failed before producing anything
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.tool_events.iter().filter_map(|event| match event {
            ToolEvent::ToolCall { name, input, .. } => Some((name.as_str(), input)),
            ToolEvent::ToolResult { .. } => None,
        })
    }

    pub fn tool_results(&self) -> impl Iterator<Item = (&str, &str, bool)> {
        self.tool_events.iter().filter_map(|event| match event {
            ToolEvent::ToolResult {
                name,
                content,
                is_error,
            } => Some((name.as_str(), content.as_str(), *is_error)),
            ToolEvent::ToolCall { .. } => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_event_wire_shape() {
        let call = ToolEvent::ToolCall {
            id: Some("toolu_1".to_string()),
            name: "Bash".to_string(),
            input: json!({"command": "ls"}),
        };
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(value["type"], "tool_call");
        assert_eq!(value["input"]["command"], "ls");
        assert_eq!(call.name(), "Bash");
    }

    #[test]
    fn test_failed_result() {
        let result = ExecutionResult::failed("boom");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert!(result.exit_code.is_none());
    }
}
