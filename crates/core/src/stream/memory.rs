use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{EntryId, EventStream, EventStreamEntry, GroupInfo, GroupState, StreamEntry};
use crate::{Error, Result};

#[derive(Default)]
struct Inner {
    entries: Vec<EventStreamEntry>,
    groups: HashMap<String, GroupState>,
}

impl Inner {
    fn group_mut(&mut self, group: &str) -> Result<&mut GroupState> {
        self.groups
            .get_mut(group)
            .ok_or_else(|| Error::Stream(format!("No such consumer group: {}", group)))
    }

    fn collect(&self, ids: Vec<u64>) -> Vec<StreamEntry> {
        ids.into_iter()
            .filter_map(|id| {
                self.entries.get((id - 1) as usize).map(|entry| StreamEntry {
                    id: EntryId(id),
                    entry: entry.clone(),
                })
            })
            .collect()
    }
}

/// In-process stream; the worker and logger share one when run together and
/// tests use it directly.
#[derive(Default)]
pub struct MemoryEventStream {
    inner: Mutex<Inner>,
    appended: Notify,
}

impl MemoryEventStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry in order, for assertions
    pub async fn entries(&self) -> Vec<EventStreamEntry> {
        self.inner.lock().await.entries.clone()
    }
}

#[async_trait]
impl EventStream for MemoryEventStream {
    async fn append(&self, entry: EventStreamEntry) -> Result<EntryId> {
        let id = {
            let mut inner = self.inner.lock().await;
            inner.entries.push(entry);
            EntryId(inner.entries.len() as u64)
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, group: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.groups.contains_key(group) {
            return Ok(false);
        }
        inner.groups.insert(group.to_string(), GroupState::default());
        Ok(true)
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;
                let total = inner.entries.len() as u64;
                let ids = inner.group_mut(group)?.claim_next(total, count, consumer);
                if !ids.is_empty() {
                    return Ok(inner.collect(ids));
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn pending(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut inner = self.inner.lock().await;
        let ids = inner.group_mut(group)?.redeliver(consumer, count);
        Ok(inner.collect(ids))
    }

    async fn ack(&self, group: &str, ids: &[EntryId]) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        Ok(inner.group_mut(group)?.ack(ids))
    }

    async fn len(&self) -> Result<u64> {
        Ok(self.inner.lock().await.entries.len() as u64)
    }

    async fn group_info(&self, group: &str) -> Result<GroupInfo> {
        let mut inner = self.inner.lock().await;
        let total = inner.entries.len() as u64;
        Ok(inner.group_mut(group)?.info(group, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::EventType;
    use serde_json::json;
    use std::sync::Arc;

    fn entry(n: u64) -> EventStreamEntry {
        EventStreamEntry::new(EventType::TaskOutput, &json!({ "n": n })).with_task_id("t-1")
    }

    #[tokio::test]
    async fn test_groups_have_independent_cursors() {
        let stream = MemoryEventStream::new();
        stream.ensure_group("logger").await.unwrap();
        stream.ensure_group("audit").await.unwrap();
        for n in 0..3 {
            stream.append(entry(n)).await.unwrap();
        }

        let a = stream
            .read_group("logger", "w1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(a.len(), 3);
        let b = stream
            .read_group("audit", "w1", 2, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(b.iter().map(|e| e.id.0).collect::<Vec<_>>(), vec![1, 2]);

        let info = stream.group_info("audit").await.unwrap();
        assert_eq!(info.lag, 1);
    }

    #[tokio::test]
    async fn test_unacked_entries_stay_pending() {
        let stream = MemoryEventStream::new();
        stream.ensure_group("g").await.unwrap();
        stream.append(entry(1)).await.unwrap();
        stream.append(entry(2)).await.unwrap();

        let delivered = stream.read_group("g", "w1", 10, Duration::ZERO).await.unwrap();
        stream.ack("g", &[delivered[0].id]).await.unwrap();

        let pending = stream.pending("g", "w1", 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, EntryId(2));

        // not redelivered as new
        assert!(stream
            .read_group("g", "w1", 10, Duration::ZERO)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_ensure_group_is_idempotent() {
        let stream = MemoryEventStream::new();
        assert!(stream.ensure_group("g").await.unwrap());
        assert!(!stream.ensure_group("g").await.unwrap());
        assert!(stream.read_group("missing", "w", 1, Duration::ZERO).await.is_err());
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let stream = Arc::new(MemoryEventStream::new());
        stream.ensure_group("g").await.unwrap();

        let writer = Arc::clone(&stream);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append(entry(7)).await.unwrap();
        });

        let got = stream
            .read_group("g", "w1", 10, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
    }
}
