//! Canonical event types carried on the stream

use std::fmt;

use serde::{Deserialize, Serialize};

/// Every event type producers publish and consumers understand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    WebhookReceived,
    WebhookValidated,
    WebhookMatched,
    WebhookTaskCreated,
    WebhookPayload,
    WebhookSkipped,
    ResponseImmediate,
    NotificationOps,
    TaskCreated,
    TaskStarted,
    TaskContextBuilt,
    TaskOutput,
    TaskRawOutput,
    TaskThinking,
    TaskToolCall,
    TaskToolResult,
    TaskUserInput,
    TaskMetrics,
    TaskCompleted,
    TaskFailed,
    TaskResponsePosted,
    KnowledgeQuery,
    KnowledgeResult,
    KnowledgeToolCall,
    KnowledgeContextUsed,
}

impl EventType {
    pub const ALL: [EventType; 25] = [
        Self::WebhookReceived,
        Self::WebhookValidated,
        Self::WebhookMatched,
        Self::WebhookTaskCreated,
        Self::WebhookPayload,
        Self::WebhookSkipped,
        Self::ResponseImmediate,
        Self::NotificationOps,
        Self::TaskCreated,
        Self::TaskStarted,
        Self::TaskContextBuilt,
        Self::TaskOutput,
        Self::TaskRawOutput,
        Self::TaskThinking,
        Self::TaskToolCall,
        Self::TaskToolResult,
        Self::TaskUserInput,
        Self::TaskMetrics,
        Self::TaskCompleted,
        Self::TaskFailed,
        Self::TaskResponsePosted,
        Self::KnowledgeQuery,
        Self::KnowledgeResult,
        Self::KnowledgeToolCall,
        Self::KnowledgeContextUsed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebhookReceived => "webhook:received",
            Self::WebhookValidated => "webhook:validated",
            Self::WebhookMatched => "webhook:matched",
            Self::WebhookTaskCreated => "webhook:task_created",
            Self::WebhookPayload => "webhook:payload",
            Self::WebhookSkipped => "webhook:skipped",
            Self::ResponseImmediate => "response:immediate",
            Self::NotificationOps => "notification:ops",
            Self::TaskCreated => "task:created",
            Self::TaskStarted => "task:started",
            Self::TaskContextBuilt => "task:context_built",
            Self::TaskOutput => "task:output",
            Self::TaskRawOutput => "task:raw_output",
            Self::TaskThinking => "task:thinking",
            Self::TaskToolCall => "task:tool_call",
            Self::TaskToolResult => "task:tool_result",
            Self::TaskUserInput => "task:user_input",
            Self::TaskMetrics => "task:metrics",
            Self::TaskCompleted => "task:completed",
            Self::TaskFailed => "task:failed",
            Self::TaskResponsePosted => "task:response_posted",
            Self::KnowledgeQuery => "knowledge:query",
            Self::KnowledgeResult => "knowledge:result",
            Self::KnowledgeToolCall => "knowledge:tool_call",
            Self::KnowledgeContextUsed => "knowledge:context_used",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }

    /// Part after the `prefix:`
    pub fn stage(&self) -> &'static str {
        let s = self.as_str();
        s.split_once(':').map_or(s, |(_, stage)| stage)
    }

    pub fn category(&self) -> EventCategory {
        EventCategory::of(self.as_str())
    }

    /// Events after which nothing more is written for a task
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TaskCompleted | Self::TaskFailed)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing family of an event, decided by its type prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Webhook,
    Response,
    Notification,
    Task,
    Knowledge,
    Unknown,
}

impl EventCategory {
    pub fn of(event_type: &str) -> Self {
        match event_type.split_once(':').map(|(prefix, _)| prefix) {
            Some("webhook") => Self::Webhook,
            Some("response") => Self::Response,
            Some("notification") => Self::Notification,
            Some("task") => Self::Task,
            Some("knowledge") => Self::Knowledge,
            _ => Self::Unknown,
        }
    }

    /// Categories whose records belong in the webhook-flow journal
    pub fn is_flow(&self) -> bool {
        matches!(self, Self::Webhook | Self::Response | Self::Notification)
    }
}
