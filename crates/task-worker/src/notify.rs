//! Operational notifications for finished tasks

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use relay_core::task::{SourceMetadata, Task, TaskStatus};
use reqwest::Client;
use serde_json::json;
use tracing::{info, warn};

use crate::error::Result;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);
const SUMMARY_CHARS: usize = 500;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Announce a finished task. Returns whether a notification went out.
    async fn notify(&self, task: &Task, output: &str) -> Result<bool>;
}

/// Posts to an ops channel through the Slack API service
pub struct SlackNotifier {
    client: Client,
    slack_api_url: String,
    channel: Option<String>,
}

fn pr_url_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"https://github\.com/[^\s\)\]]+/pull/\d+").ok())
        .as_ref()
}

/// Where a reader should look at the result: a PR the agent opened, else the
/// originating GitHub issue
pub fn view_url(task: &Task, output: &str) -> Option<String> {
    if let Some(m) = pr_url_pattern().and_then(|re| re.find(output)) {
        return Some(m.as_str().to_string());
    }
    match &task.source_metadata {
        SourceMetadata::Github {
            repo,
            number: Some(number),
            ..
        } if !repo.is_empty() => Some(format!("https://github.com/{}/issues/{}", repo, number)),
        _ => None,
    }
}

/// Message text for a finished task; `None` while the task is still live
pub fn notification_text(task: &Task, output: &str) -> Option<String> {
    match task.status {
        TaskStatus::Completed => {
            let summary: String = output.chars().take(SUMMARY_CHARS).collect();
            let summary = if summary.trim().is_empty() {
                "Done".to_string()
            } else {
                summary
            };
            let mut text = format!(
                "*Task Completed* ({})\nID: `{}`\n{}",
                task.source, task.task_id, summary
            );
            if let Some(url) = view_url(task, output) {
                text.push_str(&format!("\n<{}|View>", url));
            }
            Some(text)
        }
        TaskStatus::Failed => Some(format!(
            "*Task Failed* ({})\nID: `{}`\nError: {}",
            task.source,
            task.task_id,
            task.error.as_deref().unwrap_or("")
        )),
        _ => None,
    }
}

impl SlackNotifier {
    pub fn new(slack_api_url: impl Into<String>, channel: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(NOTIFY_TIMEOUT)
                .no_proxy()
                .build()
                .unwrap_or_else(|_| Client::new()),
            slack_api_url: slack_api_url.into(),
            channel,
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, task: &Task, output: &str) -> Result<bool> {
        let Some(channel) = self.channel.as_deref() else {
            return Ok(false);
        };
        let Some(text) = notification_text(task, output) else {
            return Ok(false);
        };

        let response = self
            .client
            .post(format!("{}/api/v1/messages", self.slack_api_url))
            .json(&json!({"channel": channel, "text": text}))
            .send()
            .await?;
        if let Err(e) = response.error_for_status_ref() {
            warn!(task_id = %task.task_id, "Slack notification rejected: {}", e);
            return Ok(false);
        }
        info!(task_id = %task.task_id, %channel, "Slack notification sent");
        Ok(true)
    }
}
