//! Task model definitions

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::descriptor::{SourceMetadata, TaskDescriptor};

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    WaitingInput,
    Completed,
    Failed,
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        Self::Queued,
        Self::Running,
        Self::WaitingInput,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::WaitingInput => "waiting_input",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states admit no outgoing transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> to` is in the transition table
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, WaitingInput)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (WaitingInput, Running)
                | (WaitingInput, Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition outside the table was attempted; the task is left unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Platform a task originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    Github,
    Jira,
    Slack,
    Dashboard,
    Api,
    #[serde(other)]
    Unknown,
}

impl Default for TaskSource {
    fn default() -> Self {
        Self::Api
    }
}

impl TaskSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Jira => "jira",
            Self::Slack => "slack",
            Self::Dashboard => "dashboard",
            Self::Api => "api",
            Self::Unknown => "unknown",
        }
    }

    /// Sources that arrive through a platform webhook and expect a reply there
    pub fn is_webhook(&self) -> bool {
        matches!(self, Self::Github | Self::Jira | Self::Slack)
    }
}

impl From<&str> for TaskSource {
    fn from(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "github" => Self::Github,
            "jira" => Self::Jira,
            "slack" => Self::Slack,
            "dashboard" => Self::Dashboard,
            "api" => Self::Api,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for TaskSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of agent work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub status: TaskStatus,
    pub source: TaskSource,
    #[serde(default)]
    pub source_metadata: SourceMetadata,
    pub assigned_agent: Option<String>,
    pub input_message: String,
    pub session_id: Option<String>,
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    pub duration_seconds: Option<f64>,
}

impl Task {
    /// Create a queued task
    pub fn new(
        task_id: impl Into<String>,
        source: TaskSource,
        input_message: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Queued,
            source,
            source_metadata: SourceMetadata::None,
            assigned_agent: None,
            input_message: input_message.into(),
            session_id: None,
            conversation_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            cost_usd: 0.0,
            input_tokens: 0,
            output_tokens: 0,
            duration_seconds: None,
        }
    }

    /// Build the queued task described by a queue entry
    pub fn from_descriptor(descriptor: &TaskDescriptor) -> Self {
        let mut task = Self::new(
            descriptor.task_id.clone(),
            descriptor.source,
            descriptor.prompt.clone(),
        )
        .with_source_metadata(SourceMetadata::from_descriptor(descriptor));
        task.assigned_agent = descriptor.assigned_agent.clone();
        task.session_id = descriptor.session_id.clone();
        task.conversation_id = descriptor.conversation_id.clone();
        task
    }

    pub fn with_source_metadata(mut self, metadata: SourceMetadata) -> Self {
        self.source_metadata = metadata;
        self
    }

    /// Move to `to` if the table allows it.
    ///
    /// Leaving `Queued` for `Running` stamps `started_at` once; resuming from
    /// `WaitingInput` keeps the original stamp. Entering a terminal state
    /// stamps `completed_at` and derives `duration_seconds` from `started_at`.
    pub fn transition(&mut self, to: TaskStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(to) {
            return Err(InvalidTransition {
                from: self.status,
                to,
            });
        }

        let now = Utc::now();
        if self.status == TaskStatus::Queued && to == TaskStatus::Running {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.completed_at = Some(now);
            self.duration_seconds = self.started_at.map(|started| seconds_between(started, now));
        }
        self.status = to;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Running)
    }

    pub fn wait_for_input(&mut self) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::WaitingInput)
    }

    pub fn resume(&mut self) -> Result<(), InvalidTransition> {
        if self.status != TaskStatus::WaitingInput {
            return Err(InvalidTransition {
                from: self.status,
                to: TaskStatus::Running,
            });
        }
        self.transition(TaskStatus::Running)
    }

    pub fn complete(
        &mut self,
        result: impl Into<String>,
        cost_usd: f64,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Completed)?;
        self.result = Some(result.into());
        self.cost_usd = cost_usd;
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), InvalidTransition> {
        self.transition(TaskStatus::Cancelled)
    }
}

/// Signed difference in seconds with millisecond precision, never negative
pub fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    end.signed_duration_since(start).num_milliseconds().max(0) as f64 / 1000.0
}
