//! File-based task storage implementation
//!
//! Stores tasks as a JSON array in a file on disk, replaced atomically on
//! every write.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::{Mutex, RwLock};

use super::model::Task;
use super::repository::TaskRepository;
use crate::fsutil::{read_json, write_json_atomic};
use crate::Result;

/// Mirror of every task the worker has seen, keyed by task id
pub struct FileTaskStore {
    path: PathBuf,
    cache: RwLock<HashMap<String, Task>>,
    /// Serializes snapshots so an older one never lands after a newer one
    write_lock: Mutex<()>,
}

impl FileTaskStore {
    /// Open the store, loading whatever an earlier run left at `path`.
    /// A missing file is an empty store; it is created on first write.
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tasks: Vec<Task> = read_json(&path)?.unwrap_or_default();
        let cache = tasks.into_iter().map(|t| (t.task_id.clone(), t)).collect();

        Ok(Self {
            path,
            cache: RwLock::new(cache),
            write_lock: Mutex::new(()),
        })
    }

    /// Persist the cache to disk on the blocking pool
    async fn persist(&self) -> Result<()> {
        let _writing = self.write_lock.lock().await;
        let mut tasks: Vec<Task> = self.cache.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_json_atomic(&path, &tasks))
            .await
            .map_err(std::io::Error::other)?
    }
}

#[async_trait]
impl TaskRepository for FileTaskStore {
    async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        let cache = self.cache.read().await;
        Ok(cache.get(task_id).cloned())
    }

    async fn save(&self, task: Task) -> Result<Task> {
        self.cache
            .write()
            .await
            .insert(task.task_id.clone(), task.clone());
        self.persist().await?;
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskSource, TaskStatus};
    use tempfile::TempDir;

    async fn create_test_store() -> (FileTaskStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tasks.json");
        let store = FileTaskStore::new(&path).await.unwrap();
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_get_task() {
        let (store, _temp) = create_test_store().await;

        store
            .save(Task::new("task-1", TaskSource::Github, "Review PR"))
            .await
            .unwrap();

        let retrieved = store.get("task-1").await.unwrap().unwrap();
        assert_eq!(retrieved.input_message, "Review PR");
        assert!(store.get("task-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_existing_task() {
        let (store, _temp) = create_test_store().await;

        let mut task = Task::new("task-1", TaskSource::Api, "x");
        store.save(task.clone()).await.unwrap();
        task.start().unwrap();
        store.save(task).await.unwrap();

        let stored = store.get("task-1").await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_persistence_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tasks.json");

        {
            let store = FileTaskStore::new(&path).await.unwrap();
            let mut task = Task::new("task-1", TaskSource::Slack, "deploy status");
            task.start().unwrap();
            task.complete("deployed", 0.1, 5, 6).unwrap();
            store.save(task).await.unwrap();
        }

        {
            let store = FileTaskStore::new(&path).await.unwrap();
            let task = store.get("task-1").await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Completed);
            assert_eq!(task.result.as_deref(), Some("deployed"));
            assert!(task.duration_seconds.is_some());
        }
    }
}
