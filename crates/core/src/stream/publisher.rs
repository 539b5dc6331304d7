//! Fire-and-forget publishing onto the event stream

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error};

use super::{EntryId, EventStream, EventStreamEntry, EventType};

/// Upper bound for `task:raw_output` payloads
pub const MAX_RAW_OUTPUT_BYTES: usize = 200 * 1024;

/// Longest prefix of `s` that fits in `max` bytes without splitting a char
pub fn truncate_to_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Publishes lifecycle events. A failed append is logged and swallowed so
/// observability problems never break task execution.
#[derive(Clone)]
pub struct EventPublisher {
    stream: Arc<dyn EventStream>,
}

impl EventPublisher {
    pub fn new(stream: Arc<dyn EventStream>) -> Self {
        Self { stream }
    }

    pub fn stream(&self) -> &Arc<dyn EventStream> {
        &self.stream
    }

    pub async fn publish(
        &self,
        event_type: EventType,
        payload: Value,
        task_id: Option<&str>,
        webhook_event_id: Option<&str>,
    ) -> Option<EntryId> {
        let mut entry = EventStreamEntry::new(event_type, &payload);
        entry.task_id = task_id.map(str::to_string);
        entry.webhook_event_id = webhook_event_id.map(str::to_string);
        self.publish_entry(entry).await
    }

    pub async fn publish_entry(&self, entry: EventStreamEntry) -> Option<EntryId> {
        match self.stream.append(entry.clone()).await {
            Ok(id) => {
                debug!(event_type = %entry.event_type, task_id = ?entry.task_id, %id, "Published event");
                Some(id)
            }
            Err(e) => {
                error!(
                    event_type = %entry.event_type,
                    task_id = ?entry.task_id,
                    "Failed to publish event: {}",
                    e
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryEventStream;
    use crate::{Error, Result};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct BrokenStream;

    #[async_trait]
    impl EventStream for BrokenStream {
        async fn append(&self, _entry: EventStreamEntry) -> Result<EntryId> {
            Err(Error::Stream("disk full".to_string()))
        }
        async fn ensure_group(&self, _group: &str) -> Result<bool> {
            Ok(true)
        }
        async fn read_group(
            &self,
            _group: &str,
            _consumer: &str,
            _count: usize,
            _block: Duration,
        ) -> Result<Vec<crate::stream::StreamEntry>> {
            Ok(Vec::new())
        }
        async fn pending(
            &self,
            _group: &str,
            _consumer: &str,
            _count: usize,
        ) -> Result<Vec<crate::stream::StreamEntry>> {
            Ok(Vec::new())
        }
        async fn ack(&self, _group: &str, _ids: &[EntryId]) -> Result<usize> {
            Ok(0)
        }
        async fn len(&self) -> Result<u64> {
            Ok(0)
        }
        async fn group_info(&self, group: &str) -> Result<crate::stream::GroupInfo> {
            Err(Error::Stream(format!("no group {}", group)))
        }
    }

    #[tokio::test]
    async fn test_publish_sets_envelope() {
        let stream = Arc::new(MemoryEventStream::new());
        let publisher = EventPublisher::new(stream.clone());

        publisher
            .publish(
                EventType::WebhookReceived,
                json!({"provider": "github"}),
                None,
                Some("wh-1"),
            )
            .await;

        let entries = stream.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, "webhook:received");
        assert_eq!(entries[0].webhook_event_id.as_deref(), Some("wh-1"));
        assert_eq!(entries[0].payload()["provider"], "github");
    }

    #[tokio::test]
    async fn test_publish_failure_is_swallowed() {
        let publisher = EventPublisher::new(Arc::new(BrokenStream));
        let id = publisher
            .publish(EventType::TaskStarted, json!({}), Some("t-1"), None)
            .await;
        assert!(id.is_none());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_to_bytes("hello", 10), "hello");
        assert_eq!(truncate_to_bytes("hello", 3), "hel");
        // 'é' is two bytes
        assert_eq!(truncate_to_bytes("héllo", 2), "h");
    }
}
