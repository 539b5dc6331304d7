//! Queue descriptor and typed source metadata

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::model::TaskSource;

/// A work queue entry as producers enqueue it.
///
/// Platform payload keys (`issue`, `repository`, `channel`, ...) that the
/// relay does not model directly are kept in `extra` so nothing is lost on
/// re-serialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDescriptor {
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub source: TaskSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskDescriptor {
    pub fn new(
        task_id: impl Into<String>,
        source: TaskSource,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            prompt: prompt.into(),
            source,
            ..Default::default()
        }
    }

    /// Attach a platform payload field such as `issue` or `repository`
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Look up `path` (e.g. `["issue", "key"]`) inside the platform payload
    pub fn field(&self, path: &[&str]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        rest.iter()
            .try_fold(self.extra.get(*first)?, |value, key| value.get(*key))
    }

    fn field_str(&self, path: &[&str]) -> Option<String> {
        match self.field(path)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn field_u64(&self, path: &[&str]) -> Option<u64> {
        match self.field(path)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Platform details extracted from a descriptor's payload
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "platform", rename_all = "snake_case")]
pub enum SourceMetadata {
    Jira {
        key: String,
        #[serde(default)]
        summary: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        jira_base_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ticket_url: Option<String>,
    },
    Github {
        repo: String,
        number: Option<u64>,
        #[serde(default)]
        title: String,
    },
    Slack {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_ts: Option<String>,
        #[serde(default)]
        text: String,
    },
    Other {
        data: Value,
    },
    #[default]
    None,
}

impl SourceMetadata {
    pub fn from_descriptor(descriptor: &TaskDescriptor) -> Self {
        match descriptor.source {
            TaskSource::Jira => {
                let key = descriptor
                    .field_str(&["issue", "key"])
                    .unwrap_or_else(|| "unknown".to_string());
                let summary = descriptor
                    .field_str(&["issue", "summary"])
                    .or_else(|| descriptor.field_str(&["issue", "fields", "summary"]))
                    .unwrap_or_default();
                let jira_base_url = descriptor
                    .field_str(&["jira_base_url"])
                    .map(|url| url.trim_end_matches('/').to_string());
                let ticket_url = jira_base_url
                    .as_ref()
                    .map(|base| format!("{}/browse/{}", base, key));
                Self::Jira {
                    key,
                    summary,
                    jira_base_url,
                    ticket_url,
                }
            }
            TaskSource::Github => Self::Github {
                repo: descriptor
                    .field_str(&["repository", "full_name"])
                    .unwrap_or_else(|| "unknown".to_string()),
                number: descriptor
                    .field_u64(&["issue", "number"])
                    .or_else(|| descriptor.field_u64(&["pull_request", "number"])),
                title: descriptor
                    .field_str(&["issue", "title"])
                    .or_else(|| descriptor.field_str(&["pull_request", "title"]))
                    .unwrap_or_default(),
            },
            TaskSource::Slack => Self::Slack {
                channel: descriptor
                    .field_str(&["channel"])
                    .unwrap_or_else(|| "unknown".to_string()),
                thread_ts: descriptor
                    .field_str(&["thread_ts"])
                    .or_else(|| descriptor.field_str(&["ts"])),
                text: descriptor.field_str(&["text"]).unwrap_or_default(),
            },
            _ => match descriptor.extra.get("source_metadata") {
                Some(data @ Value::Object(_)) => Self::Other { data: data.clone() },
                _ => Self::None,
            },
        }
    }

    /// Stable identifier of the platform thread this task belongs to
    pub fn flow_id(&self) -> Option<String> {
        match self {
            Self::Jira { key, .. } => Some(format!("jira:{}", key)),
            Self::Github { repo, number, .. } => Some(format!(
                "github:{}#{}",
                repo,
                number.map_or_else(|| "unknown".to_string(), |n| n.to_string())
            )),
            Self::Slack {
                channel, thread_ts, ..
            } => Some(format!(
                "slack:{}:{}",
                channel,
                thread_ts.as_deref().unwrap_or("unknown")
            )),
            Self::Other { .. } | Self::None => None,
        }
    }

    /// Human-readable conversation title for the flow
    pub fn title(&self) -> String {
        match self {
            Self::Jira { key, summary, .. } if !summary.is_empty() => {
                format!("Jira: {} - {}", key, summary)
            }
            Self::Jira { key, .. } => format!("Jira: {}", key),
            Self::Github {
                repo,
                number,
                title,
            } => {
                let short = repo.rsplit('/').next().unwrap_or(repo);
                let number = number.map_or_else(|| "unknown".to_string(), |n| n.to_string());
                if title.is_empty() {
                    format!("GitHub: {}#{}", short, number)
                } else {
                    format!("GitHub: {}#{} - {}", short, number, title)
                }
            }
            Self::Slack { channel, text, .. } if text.is_empty() => {
                format!("Slack: #{}", channel)
            }
            Self::Slack { channel, text, .. } => {
                let preview: String = text.chars().take(50).collect();
                let ellipsis = if text.chars().count() > 50 { "..." } else { "" };
                format!("Slack: #{} - {}{}", channel, preview, ellipsis)
            }
            Self::Other { .. } | Self::None => "Task".to_string(),
        }
    }
}
