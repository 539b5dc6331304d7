use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::WorkQueue;
use crate::task::TaskDescriptor;
use crate::Result;

/// In-process queue, used by tests and single-binary deployments
#[derive(Default)]
pub struct MemoryWorkQueue {
    items: Mutex<VecDeque<TaskDescriptor>>,
    available: Notify,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn push(&self, descriptor: &TaskDescriptor) -> Result<()> {
        self.items.lock().await.push_back(descriptor.clone());
        self.available.notify_one();
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<TaskDescriptor>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = self.items.lock().await.pop_front() {
                return Ok(Some(item));
            }
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.items.lock().await.len())
    }
}
