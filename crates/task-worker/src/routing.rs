//! Prompt routing and webhook context assembly

use std::sync::OnceLock;

use agent_runner::ExecutionResult;
use regex::Regex;
use relay_core::task::{SourceMetadata, TaskDescriptor, TaskSource};
use serde_json::Value;

use crate::conversation::ContextMessage;

/// Tools an agent uses to answer on the originating platform itself
pub const POSTING_TOOL_NAMES: [&str; 3] =
    ["send_slack_message", "add_issue_comment", "add_jira_comment"];

const MAX_POSTED_CONTENT_CHARS: usize = 10_000;

/// The task prompt with platform-specific posting instructions
pub fn build_prompt(descriptor: &TaskDescriptor) -> String {
    let metadata = SourceMetadata::from_descriptor(descriptor);
    match (&descriptor.source, &metadata) {
        (TaskSource::Jira, SourceMetadata::Jira { key, .. }) => format!(
            "Jira ticket: {key}\n\n{}\n\nIMPORTANT: After completing your analysis, post your \
             response back to Jira ticket {key} using `jira:add_jira_comment`.",
            descriptor.prompt
        ),
        (TaskSource::Github, SourceMetadata::Github { repo, number, .. }) => {
            let number = number.map(|n| n.to_string()).unwrap_or_default();
            format!(
                "GitHub {repo}#{number}\n\n{}\n\nIMPORTANT: After completing your analysis, post \
                 your response back using `github:add_issue_comment` on {repo}#{number}.",
                descriptor.prompt
            )
        }
        _ => descriptor.prompt.clone(),
    }
}

/// Routed prompt enriched with source details and recent conversation turns
pub fn build_task_context(descriptor: &TaskDescriptor, context: &[ContextMessage]) -> String {
    let mut sections = Vec::new();

    let mut header = vec![format!("Source: {}", descriptor.source)];
    if let Some(event) = descriptor.event_type.as_deref().filter(|e| !e.is_empty()) {
        header.push(format!("Event: {}", event));
    }
    if let Some(line) = metadata_line(&SourceMetadata::from_descriptor(descriptor)) {
        header.push(line);
    }
    sections.push(format!("## Task Context\n{}", header.join("\n")));

    let turns: Vec<String> = context
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| format!("**{}**: {}", capitalize(&m.role), m.content.trim()))
        .collect();
    if !turns.is_empty() {
        sections.push(format!("## Previous Conversation\n{}", turns.join("\n\n")));
    }

    sections.push(format!("## Current Request\n{}", build_prompt(descriptor)));
    sections.join("\n\n")
}

fn metadata_line(metadata: &SourceMetadata) -> Option<String> {
    match metadata {
        SourceMetadata::Jira {
            key,
            summary,
            ticket_url,
            ..
        } => {
            let mut line = format!("Ticket: {}", key);
            if !summary.is_empty() {
                line.push_str(&format!(" - {}", summary));
            }
            if let Some(url) = ticket_url {
                line.push_str(&format!(" ({})", url));
            }
            Some(line)
        }
        SourceMetadata::Github {
            repo,
            number,
            title,
        } => {
            let mut line = format!("Repository: {}", repo);
            if let Some(n) = number {
                line.push_str(&format!(" #{}", n));
            }
            if !title.is_empty() {
                line.push_str(&format!(" - {}", title));
            }
            Some(line)
        }
        SourceMetadata::Slack {
            channel, thread_ts, ..
        } => Some(match thread_ts {
            Some(ts) => format!("Channel: #{} (thread {})", channel, ts),
            None => format!("Channel: #{}", channel),
        }),
        SourceMetadata::Other { .. } | SourceMetadata::None => None,
    }
}

fn capitalize(role: &str) -> String {
    let mut chars = role.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => "Unknown".to_string(),
    }
}

fn posting_annotation() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"\[TOOL\] (?:Using|Starting:) \S*(?:add_jira_comment|add_issue_comment|send_slack_message)",
            )
            .ok()
        })
        .as_ref()
}

/// Whether the raw output shows the agent calling a posting tool
pub fn detect_mcp_posting(output: &str) -> bool {
    !output.is_empty() && posting_annotation().is_some_and(|re| re.is_match(output))
}

fn is_posting_tool(name: &str) -> bool {
    POSTING_TOOL_NAMES.iter().any(|tool| name.contains(tool))
}

/// Posting detection over the structured tool trace and the raw output
pub fn agent_already_posted(result: &ExecutionResult) -> bool {
    result.tool_calls().any(|(name, _)| is_posting_tool(name)) || detect_mcp_posting(&result.output)
}

/// Text the agent posted through a posting tool, if any
pub fn extract_mcp_posted_content(result: &ExecutionResult) -> Option<String> {
    result
        .tool_calls()
        .filter(|(name, _)| is_posting_tool(name))
        .find_map(|(_, input)| {
            ["text", "body", "commentBody"]
                .iter()
                .find_map(|key| match input.get(*key) {
                    Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                    Some(Value::Null) | None => None,
                    Some(Value::String(_)) => None,
                    Some(other) => Some(other.to_string()),
                })
        })
        .map(|text| text.chars().take(MAX_POSTED_CONTENT_CHARS).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_runner::ToolEvent;
    use serde_json::json;

    fn jira_descriptor() -> TaskDescriptor {
        TaskDescriptor::new("t-1", TaskSource::Jira, "Analyze ticket")
            .with_field("issue", json!({"key": "KAN-6", "summary": "Fix login"}))
    }

    #[test]
    fn test_build_prompt_jira() {
        let prompt = build_prompt(&jira_descriptor());
        assert!(prompt.starts_with("Jira ticket: KAN-6\n\nAnalyze ticket"));
        assert!(prompt.contains("`jira:add_jira_comment`"));
    }

    #[test]
    fn test_build_prompt_github_and_passthrough() {
        let github = TaskDescriptor::new("t-2", TaskSource::Github, "Review")
            .with_field("repository", json!({"full_name": "acme/api"}))
            .with_field("pull_request", json!({"number": 42}));
        let prompt = build_prompt(&github);
        assert!(prompt.starts_with("GitHub acme/api#42\n\nReview"));
        assert!(prompt.contains("on acme/api#42."));

        let api = TaskDescriptor::new("t-3", TaskSource::Api, "Just do it");
        assert_eq!(build_prompt(&api), "Just do it");
    }

    #[test]
    fn test_build_task_context_basic() {
        let descriptor = TaskDescriptor::new("t-1", TaskSource::Jira, "Fix the bug");
        let prompt = build_task_context(&descriptor, &[]);
        assert!(prompt.contains("Fix the bug"));
        assert!(prompt.contains("Source: jira"));
        assert!(!prompt.contains("Previous Conversation"));
    }

    #[test]
    fn test_build_task_context_with_history_and_metadata() {
        let mut descriptor = jira_descriptor();
        descriptor.event_type = Some("issue.updated".to_string());
        let context = vec![
            ContextMessage::new("user", "Previous message 1"),
            ContextMessage::new("assistant", "Previous response 1"),
        ];
        let prompt = build_task_context(&descriptor, &context);
        assert!(prompt.contains("Event: issue.updated"));
        assert!(prompt.contains("Ticket: KAN-6 - Fix login"));
        assert!(prompt.contains("**User**: Previous message 1"));
        assert!(prompt.contains("**Assistant**: Previous response 1"));
        assert!(prompt.ends_with("using `jira:add_jira_comment`."));
    }

    #[test]
    fn test_detect_mcp_posting() {
        assert!(detect_mcp_posting("[TOOL] Using add_jira_comment\n  body: test"));
        assert!(detect_mcp_posting("\n[TOOL] Using mcp__github__add_issue_comment\n"));
        assert!(detect_mcp_posting("[TOOL] Starting: send_slack_message\n"));
        assert!(!detect_mcp_posting("General analysis output"));
        assert!(!detect_mcp_posting(""));
    }

    #[test]
    fn test_posted_content_from_tool_trace() {
        let result = ExecutionResult {
            tool_events: vec![
                ToolEvent::ToolCall {
                    id: None,
                    name: "Read".to_string(),
                    input: json!({"path": "a"}),
                },
                ToolEvent::ToolCall {
                    id: None,
                    name: "mcp__jira__add_jira_comment".to_string(),
                    input: json!({"issue_key": "KAN-6", "body": "Root cause found"}),
                },
            ],
            ..Default::default()
        };
        assert!(agent_already_posted(&result));
        assert_eq!(
            extract_mcp_posted_content(&result).as_deref(),
            Some("Root cause found")
        );
        assert!(extract_mcp_posted_content(&ExecutionResult::default()).is_none());
    }
}
