//! Webhook correlation buffer
//!
//! Webhook-flow events published before the task exists carry only a
//! correlation id (`webhook_event_id`). They wait here until an event ties
//! that id to a task, then get written in arrival order ahead of it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use relay_core::stream::EntryId;
use serde_json::Value;

#[derive(Debug)]
struct Pending {
    first_seen: Instant,
    records: Vec<(EntryId, Value)>,
}

/// Records dropped because their correlation id never resolved
#[derive(Debug, PartialEq)]
pub struct Expired {
    pub correlation_id: String,
    pub entry_ids: Vec<EntryId>,
}

#[derive(Debug)]
pub struct CorrelationBuffer {
    ttl: Duration,
    pending: HashMap<String, Pending>,
}

impl CorrelationBuffer {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pending: HashMap::new(),
        }
    }

    /// Hold `record` under `correlation_id`. A redelivered entry that is
    /// already held is not added twice.
    pub fn push(&mut self, correlation_id: &str, id: EntryId, record: Value) {
        self.push_at(correlation_id, id, record, Instant::now());
    }

    fn push_at(&mut self, correlation_id: &str, id: EntryId, record: Value, now: Instant) {
        let pending = self
            .pending
            .entry(correlation_id.to_string())
            .or_insert_with(|| Pending {
                first_seen: now,
                records: Vec::new(),
            });
        if pending.records.iter().all(|(held, _)| *held != id) {
            pending.records.push((id, record));
        }
    }

    /// Remove and return everything held for `correlation_id`, oldest first
    pub fn take(&mut self, correlation_id: &str) -> Vec<(EntryId, Value)> {
        self.pending
            .remove(correlation_id)
            .map(|pending| pending.records)
            .unwrap_or_default()
    }

    pub fn evict_expired(&mut self) -> Vec<Expired> {
        self.evict_expired_at(Instant::now())
    }

    fn evict_expired_at(&mut self, now: Instant) -> Vec<Expired> {
        let ttl = self.ttl;
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, pending)| now.saturating_duration_since(pending.first_seen) >= ttl)
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|correlation_id| {
                let pending = self.pending.remove(&correlation_id)?;
                Some(Expired {
                    correlation_id,
                    entry_ids: pending.records.into_iter().map(|(id, _)| id).collect(),
                })
            })
            .collect()
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.pending.contains_key(correlation_id)
    }

    /// Number of correlation ids waiting
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of records waiting across all correlation ids
    pub fn held_records(&self) -> usize {
        self.pending.values().map(|p| p.records.len()).sum()
    }
}
