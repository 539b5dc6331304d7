//! Log assembler configuration, read from the environment

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Root shared with the worker; the event stream lives under it
    pub data_dir: PathBuf,
    pub stream_name: String,
    /// Where per-task log directories are created
    pub logs_dir: PathBuf,
    pub consumer_group: String,
    pub consumer_name: String,
    pub max_batch_size: usize,
    /// How long one stream read waits for new entries
    pub read_block: Duration,
    /// Buffered webhook records older than this are dropped
    pub correlation_ttl: Duration,
    pub pending_retry_interval: Duration,
    pub port: u16,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".relay-data"),
            stream_name: "task_events".to_string(),
            logs_dir: PathBuf::from(".relay-data/logs/tasks"),
            consumer_group: "task-logger".to_string(),
            consumer_name: "worker-1".to_string(),
            max_batch_size: 10,
            read_block: Duration::from_secs(5),
            correlation_ttl: Duration::from_secs(3600),
            pending_retry_interval: Duration::from_secs(30),
            port: 8090,
        }
    }
}

impl LoggerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or blank keys keep defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let data_dir = get("RELAY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let logs_dir = get("LOGS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("logs").join("tasks"));

        Self {
            stream_name: get("RELAY_STREAM").unwrap_or(defaults.stream_name),
            logs_dir,
            consumer_group: get("CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
            consumer_name: get("CONSUMER_NAME").unwrap_or(defaults.consumer_name),
            max_batch_size: parse_or(
                "MAX_BATCH_SIZE",
                get("MAX_BATCH_SIZE"),
                defaults.max_batch_size,
            )
            .max(1),
            read_block: defaults.read_block,
            correlation_ttl: Duration::from_secs(parse_or(
                "CORRELATION_TTL_SECONDS",
                get("CORRELATION_TTL_SECONDS"),
                defaults.correlation_ttl.as_secs(),
            )),
            pending_retry_interval: Duration::from_secs(parse_or(
                "PENDING_RETRY_SECONDS",
                get("PENDING_RETRY_SECONDS"),
                defaults.pending_retry_interval.as_secs(),
            )),
            port: parse_or("LOGGER_PORT", get("LOGGER_PORT"), defaults.port),
            data_dir,
        }
    }

    pub fn stream_dir(&self) -> PathBuf {
        self.data_dir.join("streams").join(&self.stream_name)
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
