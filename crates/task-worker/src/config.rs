//! Worker configuration, read from the environment

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use agent_runner::{ProviderKind, DEFAULT_TIMEOUT_SECONDS};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Root for the spool, event stream, task mirror and outputs
    pub data_dir: PathBuf,
    /// Event stream directory name under `data_dir`
    pub stream_name: String,
    pub max_concurrent_tasks: usize,
    pub task_timeout_seconds: u64,
    pub poll_timeout: Duration,
    pub provider: ProviderKind,
    /// Working directory for tasks that don't name one
    pub default_repo_path: PathBuf,
    /// Agent assigned to tasks that arrive without one
    pub default_agent: String,
    pub dashboard_api_url: Option<String>,
    pub github_api_url: String,
    pub jira_api_url: String,
    pub slack_api_url: String,
    pub slack_notification_channel: Option<String>,
    pub port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".relay-data"),
            stream_name: "task_events".to_string(),
            max_concurrent_tasks: 5,
            task_timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            poll_timeout: Duration::from_secs(1),
            provider: ProviderKind::Claude,
            default_repo_path: PathBuf::from("/app"),
            default_agent: "brain".to_string(),
            dashboard_api_url: None,
            github_api_url: "http://github-api:3001".to_string(),
            jira_api_url: "http://jira-api:3002".to_string(),
            slack_api_url: "http://slack-api:3003".to_string(),
            slack_notification_channel: None,
            port: 9100,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or blank keys keep defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let provider = match get("CLI_PROVIDER") {
            Some(name) => ProviderKind::parse(&name).unwrap_or_else(|e| {
                warn!("{}, falling back to {}", e, defaults.provider);
                defaults.provider
            }),
            None => defaults.provider,
        };

        Self {
            data_dir: get("RELAY_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            stream_name: get("RELAY_STREAM").unwrap_or(defaults.stream_name),
            max_concurrent_tasks: parse_or(
                "MAX_CONCURRENT_TASKS",
                get("MAX_CONCURRENT_TASKS"),
                defaults.max_concurrent_tasks,
            )
            .max(1),
            task_timeout_seconds: parse_or(
                "TASK_TIMEOUT_SECONDS",
                get("TASK_TIMEOUT_SECONDS"),
                defaults.task_timeout_seconds,
            ),
            poll_timeout: defaults.poll_timeout,
            provider,
            default_repo_path: get("DEFAULT_REPO_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.default_repo_path),
            default_agent: get("DEFAULT_AGENT").unwrap_or(defaults.default_agent),
            dashboard_api_url: get("DASHBOARD_API_URL").map(trim_url),
            github_api_url: get("GITHUB_API_URL")
                .map(trim_url)
                .unwrap_or(defaults.github_api_url),
            jira_api_url: get("JIRA_API_URL")
                .map(trim_url)
                .unwrap_or(defaults.jira_api_url),
            slack_api_url: get("SLACK_API_URL")
                .map(trim_url)
                .unwrap_or(defaults.slack_api_url),
            slack_notification_channel: get("SLACK_NOTIFICATION_CHANNEL"),
            port: parse_or("WORKER_PORT", get("WORKER_PORT"), defaults.port),
        }
    }

    pub fn spool_dir(&self) -> PathBuf {
        self.data_dir.join("queue")
    }

    pub fn stream_dir(&self) -> PathBuf {
        self.data_dir.join("streams").join(&self.stream_name)
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.data_dir.join("tasks.json")
    }
}

fn parse_or<T: FromStr + Copy + std::fmt::Display>(key: &str, value: Option<String>, default: T) -> T {
    match value {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Invalid {}={:?}, using {}", key, raw, default);
            default
        }),
        None => default,
    }
}

fn trim_url(url: String) -> String {
    url.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::from_lookup(lookup(&[]));
        assert_eq!(config.max_concurrent_tasks, 5);
        assert_eq!(config.task_timeout_seconds, 3600);
        assert_eq!(config.provider, ProviderKind::Claude);
        assert_eq!(config.default_repo_path, PathBuf::from("/app"));
        assert_eq!(config.port, 9100);
        assert!(config.dashboard_api_url.is_none());
        assert_eq!(
            config.stream_dir(),
            PathBuf::from(".relay-data/streams/task_events")
        );
    }

    #[test]
    fn test_overrides_and_invalid_values() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("MAX_CONCURRENT_TASKS", "two"),
            ("TASK_TIMEOUT_SECONDS", "120"),
            ("CLI_PROVIDER", "cursor"),
            ("DASHBOARD_API_URL", "http://dashboard:5000/"),
            ("SLACK_NOTIFICATION_CHANNEL", "  "),
        ]));
        assert_eq!(config.max_concurrent_tasks, 5);
        assert_eq!(config.task_timeout_seconds, 120);
        assert_eq!(config.provider, ProviderKind::Cursor);
        assert_eq!(
            config.dashboard_api_url.as_deref(),
            Some("http://dashboard:5000")
        );
        assert!(config.slack_notification_channel.is_none());
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        let config = WorkerConfig::from_lookup(lookup(&[("MAX_CONCURRENT_TASKS", "0")]));
        assert_eq!(config.max_concurrent_tasks, 1);
    }
}
