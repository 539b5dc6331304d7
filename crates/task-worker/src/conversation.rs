//! Dashboard conversation bridge
//!
//! Webhook tasks are attached to one dashboard conversation per platform
//! thread (the *flow*). The bridge opens or reuses that conversation, pulls
//! recent turns as prompt context and posts results back into it.

use std::time::Duration;

use async_trait::async_trait;
use relay_core::task::{SourceMetadata, Task};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::error::{Result, WorkerError};

const DASHBOARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Number of prior turns pulled into the prompt
pub const CONTEXT_MESSAGES: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: String,
    pub content: String,
}

impl ContextMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Conversation service backing webhook flows
#[async_trait]
pub trait ContextProvider: Send + Sync {
    /// Get or create the flow's conversation, register the task in it and
    /// announce the trigger. Returns the conversation id.
    async fn open_flow(&self, task: &Task) -> Result<String>;

    async fn fetch_context(&self, conversation_id: &str, limit: usize)
        -> Result<Vec<ContextMessage>>;

    async fn post_message(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
        task_id: &str,
    ) -> Result<()>;
}

#[derive(Deserialize)]
struct ConversationRef {
    conversation_id: String,
}

pub struct DashboardClient {
    client: Client,
    base_url: String,
}

impl DashboardClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(DASHBOARD_TIMEOUT)
                .no_proxy()
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn find_conversation(&self, flow_id: &str) -> Result<Option<String>> {
        let url = format!(
            "{}/api/conversations/by-flow/{}",
            self.base_url,
            urlencoding::encode(flow_id)
        );
        let response = self.client.get(url).send().await?;
        if response.status() != StatusCode::OK {
            return Ok(None);
        }
        let found: ConversationRef = response.json().await?;
        Ok(Some(found.conversation_id))
    }

    async fn create_conversation(&self, task: &Task, flow_id: &str) -> Result<String> {
        let created: ConversationRef = self
            .client
            .post(format!("{}/api/conversations", self.base_url))
            .json(&json!({
                "flow_id": flow_id,
                "title": task.source_metadata.title(),
                "source": task.source,
                "metadata": task.source_metadata,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(created.conversation_id)
    }

    async fn register_task(&self, task: &Task, conversation_id: &str, flow_id: &str) -> Result<()> {
        self.client
            .post(format!("{}/api/tasks", self.base_url))
            .json(&json!({
                "task_id": task.task_id,
                "source": task.source,
                "source_metadata": task.source_metadata,
                "input_message": task.input_message,
                "assigned_agent": task.assigned_agent,
                "conversation_id": conversation_id,
                "flow_id": flow_id,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Announcement posted into the conversation when a webhook fires
pub fn system_message(metadata: &SourceMetadata, source: &str) -> String {
    match metadata {
        SourceMetadata::Jira {
            key,
            summary,
            ticket_url,
            ..
        } => {
            let ticket = match ticket_url {
                Some(url) => format!("[{}]({})", key, url),
                None => key.clone(),
            };
            format!(
                "**Jira Webhook Triggered**\n\nTicket: {}\nSummary: {}",
                ticket, summary
            )
        }
        SourceMetadata::Github {
            repo,
            number,
            title,
        } => format!(
            "**GitHub Webhook Triggered**\n\nRepo: {}\nIssue/PR: #{}\nTitle: {}",
            repo,
            number.map_or_else(|| "unknown".to_string(), |n| n.to_string()),
            title
        ),
        SourceMetadata::Slack { channel, .. } => {
            format!("**Slack Webhook Triggered**\n\nChannel: #{}", channel)
        }
        SourceMetadata::Other { .. } | SourceMetadata::None => {
            format!("**Webhook Triggered**\n\nSource: {}", source)
        }
    }
}

/// System note explaining how the response reached the platform
pub fn fallback_notice(source: &str, posted: bool) -> String {
    if posted {
        format!(
            "MCP tools unavailable - Response was posted to {} via fallback (direct API). \
             Check the platform for the response.",
            source
        )
    } else {
        format!(
            "Response delivery failed - MCP tools unavailable and fallback to {} also failed. \
             Manual intervention needed.",
            source
        )
    }
}

#[async_trait]
impl ContextProvider for DashboardClient {
    async fn open_flow(&self, task: &Task) -> Result<String> {
        let flow_id = task.source_metadata.flow_id().ok_or_else(|| {
            WorkerError::undeliverable("dashboard", "task has no platform flow")
        })?;

        let conversation_id = match self.find_conversation(&flow_id).await? {
            Some(id) => id,
            None => self.create_conversation(task, &flow_id).await?,
        };
        info!(task_id = %task.task_id, %flow_id, %conversation_id, "Webhook conversation ready");

        self.register_task(task, &conversation_id, &flow_id).await?;
        self.post_message(
            &conversation_id,
            "system",
            &system_message(&task.source_metadata, task.source.as_str()),
            &task.task_id,
        )
        .await?;
        Ok(conversation_id)
    }

    async fn fetch_context(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ContextMessage>> {
        let messages: Vec<ContextMessage> = self
            .client
            .get(format!(
                "{}/api/conversations/{}/context",
                self.base_url, conversation_id
            ))
            .query(&[("max_messages", limit.to_string())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!(%conversation_id, count = messages.len(), "Fetched conversation context");
        Ok(messages)
    }

    async fn post_message(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
        task_id: &str,
    ) -> Result<()> {
        self.client
            .post(format!(
                "{}/api/conversations/{}/messages",
                self.base_url, conversation_id
            ))
            .json(&json!({"role": role, "content": content, "task_id": task_id}))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::{
        extract::{Path, Query, State},
        http::StatusCode,
        routing::{get, post},
        Json, Router,
    };
    use relay_core::task::{TaskDescriptor, TaskSource};
    use serde_json::Value;

    #[derive(Clone, Default)]
    struct FakeDashboard {
        posted: Arc<Mutex<Vec<(String, Value)>>>,
    }

    async fn by_flow(Path(flow): Path<String>) -> std::result::Result<Json<Value>, StatusCode> {
        if flow == "jira:KAN-1" {
            Ok(Json(json!({"conversation_id": "conv-existing"})))
        } else {
            Err(StatusCode::NOT_FOUND)
        }
    }

    async fn record(State(state): State<FakeDashboard>, Json(body): Json<Value>) -> Json<Value> {
        state.posted.lock().unwrap().push((String::new(), body));
        Json(json!({"conversation_id": "conv-new"}))
    }

    async fn record_message(
        State(state): State<FakeDashboard>,
        Path(id): Path<String>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        state.posted.lock().unwrap().push((id, body));
        Json(json!({"id": "msg-1"}))
    }

    async fn context(
        Path(_id): Path<String>,
        Query(params): Query<std::collections::HashMap<String, String>>,
    ) -> Json<Value> {
        assert_eq!(params.get("max_messages").map(String::as_str), Some("5"));
        Json(json!([{"role": "user", "content": "earlier"}]))
    }

    async fn spawn_dashboard() -> (String, FakeDashboard) {
        let state = FakeDashboard::default();
        let app = Router::new()
            .route("/api/conversations/by-flow/{flow}", get(by_flow))
            .route("/api/conversations", post(record))
            .route("/api/tasks", post(record))
            .route("/api/conversations/{id}/messages", post(record_message))
            .route("/api/conversations/{id}/context", get(context))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), state)
    }

    fn jira_task(key: &str) -> Task {
        let descriptor = TaskDescriptor::new("task-1", TaskSource::Jira, "Fix it")
            .with_field("issue", json!({"key": key, "summary": "Login broken"}));
        Task::from_descriptor(&descriptor)
    }

    #[tokio::test]
    async fn test_open_flow_reuses_existing_conversation() {
        let (url, dashboard) = spawn_dashboard().await;
        let client = DashboardClient::new(url);

        let conversation = client.open_flow(&jira_task("KAN-1")).await.unwrap();
        assert_eq!(conversation, "conv-existing");

        let posted = dashboard.posted.lock().unwrap().clone();
        assert_eq!(posted.len(), 2);
        assert_eq!(posted[0].1["flow_id"], "jira:KAN-1");
        assert_eq!(posted[1].0, "conv-existing");
        assert_eq!(posted[1].1["role"], "system");
        assert!(posted[1].1["content"]
            .as_str()
            .unwrap()
            .contains("Ticket: KAN-1"));
    }

    #[tokio::test]
    async fn test_open_flow_creates_conversation() {
        let (url, dashboard) = spawn_dashboard().await;
        let client = DashboardClient::new(url);

        let conversation = client.open_flow(&jira_task("KAN-2")).await.unwrap();
        assert_eq!(conversation, "conv-new");
        let posted = dashboard.posted.lock().unwrap().clone();
        assert_eq!(posted[0].1["title"], "Jira: KAN-2 - Login broken");
    }

    #[tokio::test]
    async fn test_fetch_context() {
        let (url, _dashboard) = spawn_dashboard().await;
        let client = DashboardClient::new(url);
        let messages = client
            .fetch_context("conv-1", CONTEXT_MESSAGES)
            .await
            .unwrap();
        assert_eq!(messages, vec![ContextMessage::new("user", "earlier")]);
    }

    #[tokio::test]
    async fn test_unreachable_dashboard_is_an_error() {
        let client = DashboardClient::new("http://127.0.0.1:9");
        assert!(client.fetch_context("conv-1", 5).await.is_err());
    }

    #[test]
    fn test_fallback_notice() {
        assert!(fallback_notice("jira", true).contains("posted to jira via fallback"));
        assert!(fallback_notice("slack", false).contains("Manual intervention needed"));
    }
}
