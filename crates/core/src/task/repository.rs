//! Task repository trait
//!
//! The worker owns the live task; this is the store it mirrors into.

use async_trait::async_trait;

use super::model::Task;
use crate::Result;

/// Repository interface for mirrored task state
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Get a task by ID
    async fn get(&self, task_id: &str) -> Result<Option<Task>>;

    /// Insert or replace a task
    async fn save(&self, task: Task) -> Result<Task>;
}
