//! Event stream
//!
//! An append-only, totally ordered log of lifecycle events. Readers consume it
//! through named consumer groups: each group has its own cursor and its own
//! set of delivered-but-unacknowledged entries, so groups never affect each
//! other and an entry stays redeliverable until its group acknowledges it.

mod event_type;
mod file;
mod memory;
mod publisher;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

pub use event_type::{EventCategory, EventType};
pub use file::FileEventStream;
pub use memory::MemoryEventStream;
pub use publisher::{truncate_to_bytes, EventPublisher, MAX_RAW_OUTPUT_BYTES};

/// Position of an entry in the stream, starting at 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One event as it travels on the stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStreamEntry {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_event_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// JSON-encoded payload
    #[serde(default)]
    pub data: String,
}

impl EventStreamEntry {
    pub fn new(event_type: EventType, payload: &Value) -> Self {
        Self::with_type(event_type.as_str(), payload)
    }

    /// Build an entry for a type outside the catalogue
    pub fn with_type(event_type: impl Into<String>, payload: &Value) -> Self {
        Self {
            event_type: event_type.into(),
            task_id: None,
            source: None,
            webhook_event_id: None,
            timestamp: Utc::now(),
            data: payload.to_string(),
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_webhook_event_id(mut self, id: impl Into<String>) -> Self {
        self.webhook_event_id = Some(id.into());
        self
    }

    pub fn kind(&self) -> Option<EventType> {
        EventType::parse(&self.event_type)
    }

    pub fn category(&self) -> EventCategory {
        EventCategory::of(&self.event_type)
    }

    /// Decoded payload; an empty payload is `{}` and a non-JSON payload is
    /// returned as a string value.
    pub fn payload(&self) -> Value {
        if self.data.trim().is_empty() {
            return Value::Object(Default::default());
        }
        serde_json::from_str(&self.data).unwrap_or_else(|_| Value::String(self.data.clone()))
    }

    /// Task id from the envelope, else from the payload
    pub fn resolved_task_id(&self) -> Option<String> {
        self.task_id.clone().or_else(|| {
            self.payload()
                .get("task_id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
        })
    }
}

/// An entry together with the id the stream assigned it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub id: EntryId,
    pub entry: EventStreamEntry,
}

/// Snapshot of a consumer group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub name: String,
    pub last_delivered: EntryId,
    pub pending: usize,
    /// Entries appended but not yet delivered to the group
    pub lag: u64,
}

#[async_trait]
pub trait EventStream: Send + Sync {
    /// Append an entry and return its id
    async fn append(&self, entry: EventStreamEntry) -> Result<EntryId>;

    /// Create `group` with its cursor before the first entry. Returns
    /// `false` when the group already existed.
    async fn ensure_group(&self, group: &str) -> Result<bool>;

    /// Deliver up to `count` never-delivered entries to `consumer`, waiting
    /// up to `block` for at least one.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    /// Entries delivered to `consumer` and not yet acknowledged, oldest first
    async fn pending(&self, group: &str, consumer: &str, count: usize)
        -> Result<Vec<StreamEntry>>;

    /// Acknowledge entries; returns how many were pending
    async fn ack(&self, group: &str, ids: &[EntryId]) -> Result<usize>;

    /// Number of entries ever appended
    async fn len(&self) -> Result<u64>;

    async fn group_info(&self, group: &str) -> Result<GroupInfo>;
}

/// Delivery bookkeeping for one pending entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PendingDelivery {
    pub consumer: String,
    pub delivered_at: DateTime<Utc>,
    pub deliveries: u32,
}

/// Cursor and pending set of a consumer group, shared by the backends
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct GroupState {
    pub last_delivered: u64,
    pub pending: BTreeMap<u64, PendingDelivery>,
}

impl GroupState {
    /// Claim the next ids (at most `count`) out of `total` for `consumer`
    pub fn claim_next(&mut self, total: u64, count: usize, consumer: &str) -> Vec<u64> {
        let first = self.last_delivered + 1;
        let last = total.min(self.last_delivered + count as u64);
        let ids: Vec<u64> = (first..=last).collect();
        let now = Utc::now();
        for id in &ids {
            self.pending.insert(
                *id,
                PendingDelivery {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
        }
        if let Some(last) = ids.last() {
            self.last_delivered = *last;
        }
        ids
    }

    /// Ids pending for `consumer`, counted as redelivered
    pub fn redeliver(&mut self, consumer: &str, count: usize) -> Vec<u64> {
        let now = Utc::now();
        self.pending
            .iter_mut()
            .filter(|(_, p)| p.consumer == consumer)
            .take(count)
            .map(|(id, p)| {
                p.deliveries += 1;
                p.delivered_at = now;
                *id
            })
            .collect()
    }

    pub fn ack(&mut self, ids: &[EntryId]) -> usize {
        ids.iter()
            .filter(|id| self.pending.remove(&id.0).is_some())
            .count()
    }

    pub fn info(&self, name: &str, total: u64) -> GroupInfo {
        GroupInfo {
            name: name.to_string(),
            last_delivered: EntryId(self.last_delivered),
            pending: self.pending.len(),
            lag: total.saturating_sub(self.last_delivered),
        }
    }
}
