//! Event correlator
//!
//! Consumes the event stream through a durable consumer group and turns
//! events into per-task log directories. An entry is acknowledged only after
//! its records are on disk, or once it is deliberately dropped. Webhook
//! records that arrive before their task is known are held in the
//! correlation buffer and stay unacknowledged until they are flushed or
//! expire, so a crash in between leads to redelivery rather than loss.
//!
//! The correlator owns its registry and buffer outright: one instance, one
//! loop, no locks.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use relay_core::stream::{EntryId, EventCategory, EventStream, EventStreamEntry, EventType, StreamEntry};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::LoggerConfig;
use crate::correlation::CorrelationBuffer;
use crate::error::Result;
use crate::handlers;
use crate::registry::LogRegistry;
use crate::task_log::TaskLog;

const READ_ERROR_BACKOFF: Duration = Duration::from_secs(5);
const PENDING_SWEEP_LIMIT: usize = 10_000;

/// Counters shared with the ops API
#[derive(Debug, Default)]
pub struct CorrelatorMetrics {
    processed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    expired: AtomicU64,
    buffered: AtomicUsize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub dropped: u64,
    pub expired: u64,
    pub buffered: usize,
}

impl CorrelatorMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
        }
    }
}

/// What to do with an entry once it has been handled
#[derive(Debug, PartialEq)]
enum Disposition {
    /// Written, already applied or dropped: acknowledge these ids
    Ack(Vec<EntryId>),
    /// Held in the correlation buffer
    Buffered,
}

pub struct Correlator {
    config: LoggerConfig,
    stream: Arc<dyn EventStream>,
    registry: LogRegistry,
    buffer: CorrelationBuffer,
    metrics: Arc<CorrelatorMetrics>,
}

/// Write everything buffered under `correlation_id` into `log`, oldest
/// first. Returns the ids to acknowledge.
fn flush_buffered(
    buffer: &mut CorrelationBuffer,
    log: &mut TaskLog,
    correlation_id: Option<&str>,
) -> Result<Vec<EntryId>> {
    let Some(correlation_id) = correlation_id else {
        return Ok(Vec::new());
    };
    let records = buffer.take(correlation_id);
    if !records.is_empty() {
        debug!(
            task_id = %log.task_id(),
            %correlation_id,
            count = records.len(),
            "Flushing correlated webhook events"
        );
    }

    let mut ids = Vec::with_capacity(records.len());
    for (id, record) in records {
        if !log.is_applied(id) {
            log.append_webhook_event(&record)?;
            log.mark_applied(id)?;
        }
        ids.push(id);
    }
    Ok(ids)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

impl Correlator {
    pub fn new(config: LoggerConfig, stream: Arc<dyn EventStream>) -> Self {
        Self {
            registry: LogRegistry::new(&config.logs_dir),
            buffer: CorrelationBuffer::new(config.correlation_ttl),
            metrics: Arc::new(CorrelatorMetrics::default()),
            config,
            stream,
        }
    }

    pub fn metrics(&self) -> Arc<CorrelatorMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Create the consumer group if needed and re-process whatever this
    /// consumer left unacknowledged last time
    pub async fn start(&mut self) -> Result<()> {
        let group = &self.config.consumer_group;
        if self.stream.ensure_group(group).await? {
            info!(%group, "Consumer group created");
        } else {
            info!(%group, "Consumer group exists");
        }
        let recovered = self.recover_pending().await?;
        if recovered > 0 {
            info!(recovered, "Re-processed pending entries");
        }
        Ok(())
    }

    /// Consume until `shutdown` turns true
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.start().await?;
        info!(
            group = %self.config.consumer_group,
            consumer = %self.config.consumer_name,
            "Correlator started"
        );

        let mut last_sweep = Instant::now();
        while !*shutdown.borrow() {
            let stream = Arc::clone(&self.stream);
            let read = tokio::select! {
                read = stream.read_group(
                    &self.config.consumer_group,
                    &self.config.consumer_name,
                    self.config.max_batch_size,
                    self.config.read_block,
                ) => read,
                _ = shutdown.changed() => break,
            };

            match read {
                Ok(entries) => self.process_batch(entries).await,
                Err(e) => {
                    error!("Stream read failed: {}", e);
                    tokio::time::sleep(READ_ERROR_BACKOFF).await;
                }
            }
            self.evict_expired().await;

            if last_sweep.elapsed() >= self.config.pending_retry_interval {
                if let Err(e) = self.recover_pending().await {
                    error!("Pending sweep failed: {}", e);
                }
                last_sweep = Instant::now();
            }
        }

        info!("Correlator stopped");
        Ok(())
    }

    /// One read-process-evict round. Returns how many entries were read.
    pub async fn poll_once(&mut self) -> Result<usize> {
        let entries = self
            .stream
            .read_group(
                &self.config.consumer_group,
                &self.config.consumer_name,
                self.config.max_batch_size,
                self.config.read_block,
            )
            .await?;
        let count = entries.len();
        self.process_batch(entries).await;
        self.evict_expired().await;
        Ok(count)
    }

    /// Re-process entries delivered to this consumer but never acknowledged
    pub async fn recover_pending(&mut self) -> Result<usize> {
        let entries = self
            .stream
            .pending(
                &self.config.consumer_group,
                &self.config.consumer_name,
                PENDING_SWEEP_LIMIT,
            )
            .await?;
        let count = entries.len();
        self.process_batch(entries).await;
        Ok(count)
    }

    /// Handle each entry independently; a failing entry stays pending and
    /// does not hold up the rest.
    pub async fn process_batch(&mut self, entries: Vec<StreamEntry>) {
        for stream_entry in entries {
            let id = stream_entry.id;
            let event_type = stream_entry.entry.event_type.clone();
            match self.process_entry(stream_entry) {
                Ok(Disposition::Ack(ids)) => {
                    self.metrics.processed.fetch_add(1, Ordering::Relaxed);
                    self.ack(&ids).await;
                }
                Ok(Disposition::Buffered) => {
                    debug!(%id, %event_type, "Buffered until its task is known");
                }
                Err(e) => {
                    self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                    error!(%id, %event_type, "Event processing failed: {}", e);
                }
            }
        }
        self.metrics
            .buffered
            .store(self.buffer.held_records(), Ordering::Relaxed);
    }

    fn process_entry(&mut self, stream_entry: StreamEntry) -> Result<Disposition> {
        let StreamEntry { id, entry } = stream_entry;
        match entry.category() {
            category if category.is_flow() => self.handle_flow(id, &entry),
            EventCategory::Task => self.handle_task(id, &entry),
            EventCategory::Knowledge => self.handle_knowledge(id, &entry),
            _ => {
                warn!(%id, event_type = %entry.event_type, "Unknown event type, dropping");
                Ok(self.drop_entry(id))
            }
        }
    }

    fn drop_entry(&self, id: EntryId) -> Disposition {
        self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
        Disposition::Ack(vec![id])
    }

    fn handle_flow(&mut self, id: EntryId, entry: &EventStreamEntry) -> Result<Disposition> {
        let payload = entry.payload();
        let record = handlers::flow_record(entry, &payload);
        let correlation_id = non_empty(entry.webhook_event_id.as_deref());

        let Some(task_id) = entry.resolved_task_id() else {
            return Ok(match correlation_id {
                Some(correlation_id) => {
                    self.buffer.push(correlation_id, id, record);
                    Disposition::Buffered
                }
                None => {
                    warn!(%id, event_type = %entry.event_type, "Flow event without task or correlation id, dropping");
                    self.drop_entry(id)
                }
            });
        };

        let log = self.registry.get_or_open(&task_id)?;
        let mut ids = flush_buffered(&mut self.buffer, log, correlation_id)?;
        if !log.is_applied(id) {
            log.append_webhook_event(&record)?;
            log.mark_applied(id)?;
        }
        ids.push(id);
        Ok(Disposition::Ack(ids))
    }

    fn handle_task(&mut self, id: EntryId, entry: &EventStreamEntry) -> Result<Disposition> {
        let Some(task_id) = entry.resolved_task_id() else {
            warn!(%id, event_type = %entry.event_type, "Task event without task id, dropping");
            return Ok(self.drop_entry(id));
        };
        let Some(kind) = entry.kind() else {
            warn!(%id, event_type = %entry.event_type, "Unknown task event type, dropping");
            return Ok(self.drop_entry(id));
        };
        let payload = entry.payload();

        if kind == EventType::TaskCreated {
            let source = payload
                .get("source")
                .and_then(Value::as_str)
                .or(entry.source.as_deref());
            if let Some(source) = source {
                self.registry.remember_source(&task_id, source);
            }
        }

        let log = self.registry.get_or_open(&task_id)?;
        let mut ids = flush_buffered(
            &mut self.buffer,
            log,
            non_empty(entry.webhook_event_id.as_deref()),
        )?;
        if log.is_applied(id) {
            debug!(%id, %task_id, "Entry already applied, skipping write");
        } else {
            handlers::apply_task_event(log, kind, &entry.timestamp.to_rfc3339(), &payload)?;
            log.mark_applied(id)?;
        }
        ids.push(id);

        if kind.is_terminal() {
            self.registry.evict(&task_id);
        }
        Ok(Disposition::Ack(ids))
    }

    fn handle_knowledge(&mut self, id: EntryId, entry: &EventStreamEntry) -> Result<Disposition> {
        let (Some(task_id), Some(kind)) = (entry.resolved_task_id(), entry.kind()) else {
            warn!(%id, event_type = %entry.event_type, "Knowledge event without task id, dropping");
            return Ok(self.drop_entry(id));
        };

        let log = self.registry.get_or_open(&task_id)?;
        if !log.is_applied(id) {
            handlers::apply_knowledge_event(
                log,
                kind,
                &entry.timestamp.to_rfc3339(),
                &entry.payload(),
            )?;
            log.mark_applied(id)?;
        }
        Ok(Disposition::Ack(vec![id]))
    }

    async fn evict_expired(&mut self) {
        for expired in self.buffer.evict_expired() {
            warn!(
                correlation_id = %expired.correlation_id,
                count = expired.entry_ids.len(),
                "Correlation expired before a task was known, dropping buffered events"
            );
            self.metrics.expired.fetch_add(1, Ordering::Relaxed);
            self.ack(&expired.entry_ids).await;
        }
        self.metrics
            .buffered
            .store(self.buffer.held_records(), Ordering::Relaxed);
    }

    async fn ack(&self, ids: &[EntryId]) {
        if ids.is_empty() {
            return;
        }
        if let Err(e) = self.stream.ack(&self.config.consumer_group, ids).await {
            error!(?ids, "Acknowledgement failed, entries will be redelivered: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::stream::MemoryEventStream;
    use serde_json::json;
    use tempfile::TempDir;

    use crate::task_log::{assemble, count_task_dirs, resolve};

    struct Fixture {
        stream: Arc<MemoryEventStream>,
        correlator: Correlator,
        temp_dir: TempDir,
    }

    impl Fixture {
        async fn new(correlation_ttl: Duration) -> Self {
            let temp_dir = TempDir::new().unwrap();
            let config = LoggerConfig {
                logs_dir: temp_dir.path().join("logs"),
                read_block: Duration::from_millis(10),
                correlation_ttl,
                ..Default::default()
            };
            let stream = Arc::new(MemoryEventStream::new());
            let mut correlator = Correlator::new(config, stream.clone());
            correlator.start().await.unwrap();
            Self {
                stream,
                correlator,
                temp_dir,
            }
        }

        async fn append(&self, entry: EventStreamEntry) -> EntryId {
            self.stream.append(entry).await.unwrap()
        }

        async fn pending(&self) -> usize {
            self.stream.group_info("task-logger").await.unwrap().pending
        }

        fn logs_dir(&self) -> std::path::PathBuf {
            self.temp_dir.path().join("logs")
        }

        fn logs(&self, task_id: &str) -> Value {
            assemble(&resolve(&self.logs_dir(), task_id).unwrap()).unwrap()
        }
    }

    fn webhook(event_type: EventType, payload: Value) -> EventStreamEntry {
        EventStreamEntry::new(event_type, &payload).with_webhook_event_id("wh-1")
    }

    fn task_event(event_type: EventType, task_id: &str, payload: Value) -> EventStreamEntry {
        EventStreamEntry::new(event_type, &payload).with_task_id(task_id)
    }

    #[tokio::test]
    async fn test_webhook_events_flush_in_arrival_order() {
        let mut fx = Fixture::new(Duration::from_secs(3600)).await;
        fx.append(webhook(EventType::WebhookReceived, json!({"source": "jira"})))
            .await;
        fx.append(webhook(EventType::WebhookValidated, json!({"valid": true})))
            .await;

        fx.correlator.poll_once().await.unwrap();
        assert_eq!(fx.pending().await, 2);
        assert_eq!(count_task_dirs(&fx.logs_dir()).unwrap(), 0);

        fx.append(webhook(
            EventType::WebhookTaskCreated,
            json!({"task_id": "task-0001"}),
        ))
        .await;
        fx.correlator.poll_once().await.unwrap();

        let flow = fx.logs("task-0001")["webhook_flow"].clone();
        let stages: Vec<&str> = flow
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["stage"].as_str().unwrap())
            .collect();
        assert_eq!(stages, vec!["received", "validated", "task_created"]);
        assert_eq!(fx.pending().await, 0);
        assert_eq!(fx.correlator.metrics().snapshot().buffered, 0);
    }

    #[tokio::test]
    async fn test_expired_correlation_is_acknowledged_and_dropped() {
        let mut fx = Fixture::new(Duration::ZERO).await;
        fx.append(webhook(EventType::WebhookReceived, json!({})))
            .await;

        fx.correlator.poll_once().await.unwrap();

        assert_eq!(fx.pending().await, 0);
        assert_eq!(fx.correlator.metrics().snapshot().expired, 1);
        assert_eq!(count_task_dirs(&fx.logs_dir()).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_task_lifecycle_and_late_events_share_directory() {
        let mut fx = Fixture::new(Duration::from_secs(3600)).await;
        fx.append(task_event(
            EventType::TaskCreated,
            "task-0002",
            json!({"source": "slack", "input_message": "hi"}),
        ))
        .await;
        fx.append(task_event(
            EventType::TaskOutput,
            "task-0002",
            json!({"content": "hello"}),
        ))
        .await;
        fx.append(task_event(
            EventType::TaskCompleted,
            "task-0002",
            json!({"result": "hello", "status": "completed"}),
        ))
        .await;
        fx.correlator.poll_once().await.unwrap();
        assert!(fx.correlator.registry.is_empty());

        fx.append(task_event(
            EventType::TaskResponsePosted,
            "task-0002",
            json!({"method": "fallback", "source": "slack"}),
        ))
        .await;
        fx.correlator.poll_once().await.unwrap();

        assert_eq!(count_task_dirs(&fx.logs_dir()).unwrap(), 1);
        let dir = resolve(&fx.logs_dir(), "task-0002").unwrap();
        assert!(dir.to_string_lossy().ends_with("_slack_task-000"));
        let logs = fx.logs("task-0002");
        assert_eq!(logs["metadata"]["status"], "completed");
        assert_eq!(logs["input"]["message"], "hi");
        assert_eq!(logs["agent_output"][0]["content"], "hello");
        assert_eq!(logs["response_posting"][0]["method"], "fallback");
        assert_eq!(fx.pending().await, 0);
    }

    #[tokio::test]
    async fn test_redelivered_entry_is_written_once() {
        let mut fx = Fixture::new(Duration::from_secs(3600)).await;
        let entry = task_event(EventType::TaskThinking, "task-0003", json!({"content": "x"}));
        let id = fx.append(entry.clone()).await;
        let delivered = StreamEntry { id, entry };

        fx.correlator.process_batch(vec![delivered.clone()]).await;
        fx.correlator.process_batch(vec![delivered]).await;

        let logs = fx.logs("task-0003");
        assert_eq!(logs["agent_output"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_entry_stays_pending_without_blocking_batch() {
        let mut fx = Fixture::new(Duration::from_secs(3600)).await;
        fx.append(task_event(EventType::TaskOutput, "../escape", json!({"content": "x"})))
            .await;
        fx.append(task_event(EventType::TaskOutput, "task-0004", json!({"content": "ok"})))
            .await;

        fx.correlator.poll_once().await.unwrap();

        assert_eq!(fx.logs("task-0004")["agent_output"][0]["content"], "ok");
        assert_eq!(fx.pending().await, 1);
        let metrics = fx.correlator.metrics().snapshot();
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.processed, 1);
    }

    #[tokio::test]
    async fn test_unknown_events_are_dropped() {
        let mut fx = Fixture::new(Duration::from_secs(3600)).await;
        fx.append(EventStreamEntry::with_type("audit:login", &json!({})))
            .await;
        fx.append(EventStreamEntry::new(EventType::TaskOutput, &json!({"content": "orphan"})))
            .await;

        fx.correlator.poll_once().await.unwrap();

        assert_eq!(fx.pending().await, 0);
        assert_eq!(fx.correlator.metrics().snapshot().dropped, 2);
    }

    #[tokio::test]
    async fn test_pending_entries_are_recovered_on_start() {
        let temp_dir = TempDir::new().unwrap();
        let config = LoggerConfig {
            logs_dir: temp_dir.path().join("logs"),
            read_block: Duration::from_millis(10),
            ..Default::default()
        };
        let stream = Arc::new(MemoryEventStream::new());
        stream.ensure_group("task-logger").await.unwrap();
        stream
            .append(task_event(EventType::TaskOutput, "task-0005", json!({"content": "late"})))
            .await
            .unwrap();
        // Delivered to the consumer, then the process died before acking
        stream
            .read_group("task-logger", "worker-1", 10, Duration::ZERO)
            .await
            .unwrap();

        let mut correlator = Correlator::new(config, stream.clone());
        correlator.start().await.unwrap();

        let dir = resolve(&temp_dir.path().join("logs"), "task-0005").unwrap();
        assert_eq!(assemble(&dir).unwrap()["agent_output"][0]["content"], "late");
        assert_eq!(stream.group_info("task-logger").await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_knowledge_events_land_in_knowledge_journal() {
        let mut fx = Fixture::new(Duration::from_secs(3600)).await;
        fx.append(task_event(
            EventType::KnowledgeQuery,
            "task-0006",
            json!({"tool_name": "knowledge_query", "query": "login flow"}),
        ))
        .await;

        fx.correlator.poll_once().await.unwrap();

        let logs = fx.logs("task-0006");
        assert_eq!(logs["knowledge_interactions"][0]["query"], "login flow");
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let config = LoggerConfig {
            logs_dir: temp_dir.path().join("logs"),
            read_block: Duration::from_millis(50),
            ..Default::default()
        };
        let stream = Arc::new(MemoryEventStream::new());
        let (tx, rx) = watch::channel(false);
        let mut correlator = Correlator::new(config, stream.clone());
        let handle = tokio::spawn(async move { correlator.run(rx).await });

        stream
            .append(task_event(EventType::TaskStarted, "task-0007", json!({})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();

        handle.await.unwrap().unwrap();
        let dir = resolve(&temp_dir.path().join("logs"), "task-0007").unwrap();
        assert_eq!(assemble(&dir).unwrap()["metadata"]["status"], "running");
    }
}
