//! Fallback response delivery and loop prevention

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use agent_runner::ToolEvent;
use async_trait::async_trait;
use relay_core::task::{SourceMetadata, Task};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{Result, WorkerError};

const PLATFORM_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_COMMENT_CHARS: usize = 8000;
const MAX_SLACK_CHARS: usize = 4000;

/// Comments the relay itself posted are remembered this long so that their
/// webhooks are not turned into new tasks
pub const LOOP_PREVENTION_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostOutcome {
    pub posted: bool,
    pub comment_id: Option<String>,
}

/// Delivers a finished task's result to its originating platform
#[async_trait]
pub trait ResponsePoster: Send + Sync {
    async fn post(&self, task: &Task, body: &str, success: bool) -> Result<PostOutcome>;
}

#[derive(Debug, Clone)]
pub struct PlatformUrls {
    pub github: String,
    pub jira: String,
    pub slack: String,
}

pub struct PlatformPoster {
    client: Client,
    urls: PlatformUrls,
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Body text as it goes out: failures are labelled, then the platform limit
/// applies
pub fn format_body(body: &str, success: bool, max_chars: usize) -> String {
    let text = if success {
        body.to_string()
    } else {
        format!("Task failed.\n\n{}", body)
    };
    truncate_chars(&text, max_chars)
}

fn comment_id_of(value: &Value) -> Option<String> {
    ["id", "ts", "comment_id"]
        .iter()
        .find_map(|key| match value.get(*key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

impl PlatformPoster {
    pub fn new(urls: PlatformUrls) -> Self {
        Self {
            client: Client::builder()
                .timeout(PLATFORM_TIMEOUT)
                .no_proxy()
                .build()
                .unwrap_or_else(|_| Client::new()),
            urls,
        }
    }

    async fn send(&self, url: String, payload: Value) -> Result<PostOutcome> {
        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await.unwrap_or(Value::Null);
        Ok(PostOutcome {
            posted: true,
            comment_id: comment_id_of(&body),
        })
    }
}

#[async_trait]
impl ResponsePoster for PlatformPoster {
    async fn post(&self, task: &Task, body: &str, success: bool) -> Result<PostOutcome> {
        if body.trim().is_empty() {
            return Ok(PostOutcome::default());
        }

        let outcome = match &task.source_metadata {
            SourceMetadata::Github { repo, number, .. } => {
                let number = number
                    .ok_or_else(|| WorkerError::undeliverable("github", "missing issue number"))?;
                self.send(
                    format!(
                        "{}/api/v1/repos/{}/issues/{}/comments",
                        self.urls.github, repo, number
                    ),
                    json!({"body": format_body(body, success, MAX_COMMENT_CHARS)}),
                )
                .await?
            }
            SourceMetadata::Jira { key, .. } => {
                self.send(
                    format!(
                        "{}/api/v1/issues/{}/comments",
                        self.urls.jira,
                        urlencoding::encode(key)
                    ),
                    json!({"body": format_body(body, success, MAX_COMMENT_CHARS)}),
                )
                .await?
            }
            SourceMetadata::Slack {
                channel, thread_ts, ..
            } => {
                self.send(
                    format!("{}/api/v1/messages", self.urls.slack),
                    json!({
                        "channel": channel,
                        "text": format_body(body, success, MAX_SLACK_CHARS),
                        "thread_ts": thread_ts,
                    }),
                )
                .await?
            }
            SourceMetadata::Other { .. } | SourceMetadata::None => {
                return Err(WorkerError::undeliverable(
                    "platform",
                    format!("no delivery target for source {}", task.source),
                ));
            }
        };

        info!(
            task_id = %task.task_id,
            source = %task.source,
            comment_id = ?outcome.comment_id,
            "Fallback response posted"
        );
        Ok(outcome)
    }
}

/// Comment ids found in the results of the agent's own posting tools
pub fn extract_posted_comment_ids(tool_events: &[ToolEvent]) -> Vec<String> {
    tool_events
        .iter()
        .filter_map(|event| match event {
            ToolEvent::ToolResult { content, .. } if !content.is_empty() => {
                serde_json::from_str::<Value>(content).ok()
            }
            _ => None,
        })
        .filter(Value::is_object)
        .filter_map(|value| comment_id_of(&value))
        .collect()
}

/// Remembers comment ids the relay posted, each for a bounded time
#[derive(Debug)]
pub struct CommentLedger {
    ttl: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl Default for CommentLedger {
    fn default() -> Self {
        Self::new(LOOP_PREVENTION_TTL)
    }
}

impl CommentLedger {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn track(&self, comment_ids: &[String], task_id: &str, method: &str) {
        if comment_ids.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, at| now.duration_since(*at) < self.ttl);
        for id in comment_ids {
            entries.insert(id.clone(), now);
        }
        info!(%task_id, %method, ?comment_ids, "Tracking posted comments");
    }

    /// Whether a webhook for this comment should be ignored
    pub fn is_own_comment(&self, comment_id: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let own = entries
            .get(comment_id)
            .is_some_and(|at| at.elapsed() < self.ttl);
        debug!(%comment_id, own, "Loop prevention lookup");
        own
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.values().filter(|at| at.elapsed() < self.ttl).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::{extract::State, routing::post, Json, Router};
    use relay_core::task::{TaskDescriptor, TaskSource};

    type Seen = Arc<std::sync::Mutex<Vec<(String, Value)>>>;

    async fn spawn_platform() -> (PlatformUrls, Seen) {
        let seen: Seen = Arc::default();
        async fn handle(
            State(seen): State<Seen>,
            uri: axum::http::Uri,
            Json(body): Json<Value>,
        ) -> Json<Value> {
            seen.lock().unwrap().push((uri.path().to_string(), body));
            Json(json!({"id": 9001, "ts": "1700000000.1"}))
        }
        let app = Router::new()
            .route("/api/v1/repos/{owner}/{repo}/issues/{n}/comments", post(handle))
            .route("/api/v1/issues/{key}/comments", post(handle))
            .route("/api/v1/messages", post(handle))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let urls = PlatformUrls {
            github: base.clone(),
            jira: base.clone(),
            slack: base,
        };
        (urls, seen)
    }

    fn task(descriptor: TaskDescriptor) -> Task {
        Task::from_descriptor(&descriptor)
    }

    #[tokio::test]
    async fn test_github_comment() {
        let (urls, seen) = spawn_platform().await;
        let poster = PlatformPoster::new(urls);
        let github = task(
            TaskDescriptor::new("t-1", TaskSource::Github, "Review")
                .with_field("repository", json!({"full_name": "acme/api"}))
                .with_field("issue", json!({"number": 7})),
        );

        let outcome = poster.post(&github, "Looks good", true).await.unwrap();
        assert!(outcome.posted);
        assert_eq!(outcome.comment_id.as_deref(), Some("9001"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].0, "/api/v1/repos/acme/api/issues/7/comments");
        assert_eq!(seen[0].1["body"], "Looks good");
    }

    #[tokio::test]
    async fn test_failed_slack_message_is_labelled_and_truncated() {
        let (urls, seen) = spawn_platform().await;
        let poster = PlatformPoster::new(urls);
        let slack = task(
            TaskDescriptor::new("t-2", TaskSource::Slack, "Help")
                .with_field("channel", json!("C123"))
                .with_field("thread_ts", json!("171.2")),
        );

        poster
            .post(&slack, &"e".repeat(5000), false)
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        let text = seen[0].1["text"].as_str().unwrap();
        assert!(text.starts_with("Task failed.\n\n"));
        assert_eq!(text.chars().count(), MAX_SLACK_CHARS);
        assert_eq!(seen[0].1["thread_ts"], "171.2");
    }

    #[tokio::test]
    async fn test_non_platform_task_is_undeliverable() {
        let (urls, _seen) = spawn_platform().await;
        let poster = PlatformPoster::new(urls);
        let api = task(TaskDescriptor::new("t-3", TaskSource::Api, "x"));
        assert!(matches!(
            poster.post(&api, "done", true).await,
            Err(WorkerError::Undeliverable { .. })
        ));
    }

    #[test]
    fn test_extract_posted_comment_ids() {
        let events = vec![
            ToolEvent::ToolCall {
                id: None,
                name: "add_jira_comment".to_string(),
                input: json!({}),
            },
            ToolEvent::ToolResult {
                name: "add_jira_comment".to_string(),
                content: r#"{"id": "10042"}"#.to_string(),
                is_error: false,
            },
            ToolEvent::ToolResult {
                name: "send_slack_message".to_string(),
                content: r#"{"ok": true, "ts": "1700.5"}"#.to_string(),
                is_error: false,
            },
            ToolEvent::ToolResult {
                name: "Bash".to_string(),
                content: "not json".to_string(),
                is_error: false,
            },
        ];
        assert_eq!(extract_posted_comment_ids(&events), vec!["10042", "1700.5"]);
    }

    #[test]
    fn test_comment_ledger_expires() {
        let ledger = CommentLedger::new(Duration::from_millis(50));
        ledger.track(&["c-1".to_string()], "t-1", "mcp");
        assert!(ledger.is_own_comment("c-1"));
        assert!(!ledger.is_own_comment("c-2"));
        std::thread::sleep(Duration::from_millis(80));
        assert!(!ledger.is_own_comment("c-1"));
        assert!(ledger.is_empty());
    }
}
