//! Spool-directory queue
//!
//! Producers drop `<sortable-name>.json` files into the spool directory; the
//! consumer claims the oldest by renaming it into `claimed/`, so two
//! consumers never take the same entry. Entries that cannot be read or
//! parsed are moved to `rejected/`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use super::WorkQueue;
use crate::fsutil::write_json_atomic;
use crate::task::TaskDescriptor;
use crate::Result;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct DirWorkQueue {
    spool: PathBuf,
}

impl DirWorkQueue {
    pub fn new(spool: impl Into<PathBuf>) -> Result<Self> {
        let spool = spool.into();
        std::fs::create_dir_all(spool.join("claimed"))?;
        std::fs::create_dir_all(spool.join("rejected"))?;
        Ok(Self { spool })
    }

    fn pending_files(&self) -> Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.spool)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        Ok(files)
    }

    fn try_claim(&self) -> Result<Option<TaskDescriptor>> {
        for path in self.pending_files()? {
            let Some(name) = path.file_name() else {
                continue;
            };
            let claimed = self.spool.join("claimed").join(name);
            match std::fs::rename(&path, &claimed) {
                Ok(()) => {}
                // another consumer got there first
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }

            let decoded = std::fs::read(&claimed)
                .map_err(|e| e.to_string())
                .and_then(|bytes| {
                    serde_json::from_slice::<TaskDescriptor>(&bytes).map_err(|e| e.to_string())
                });
            match decoded {
                Ok(descriptor) => {
                    std::fs::remove_file(&claimed)?;
                    return Ok(Some(descriptor));
                }
                Err(e) => {
                    warn!("Rejecting unreadable queue entry {}: {}", path.display(), e);
                    std::fs::rename(&claimed, self.spool.join("rejected").join(name))?;
                }
            }
        }
        Ok(None)
    }

    pub fn spool(&self) -> &Path {
        &self.spool
    }
}

#[async_trait]
impl WorkQueue for DirWorkQueue {
    async fn push(&self, descriptor: &TaskDescriptor) -> Result<()> {
        let name = format!(
            "{:020}-{}.json",
            Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            Uuid::new_v4().simple()
        );
        write_json_atomic(&self.spool.join(name), descriptor)
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<TaskDescriptor>> {
        let deadline = Instant::now() + timeout;
        loop {
            let queue = self.clone();
            let claimed = tokio::task::spawn_blocking(move || queue.try_claim())
                .await
                .map_err(std::io::Error::other)??;
            if let Some(descriptor) = claimed {
                return Ok(Some(descriptor));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.pending_files()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskSource;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_spool_fifo_and_claim() {
        let temp = TempDir::new().unwrap();
        let queue = DirWorkQueue::new(temp.path().join("spool")).unwrap();

        queue
            .push(&TaskDescriptor::new("first", TaskSource::Api, "a"))
            .await
            .unwrap();
        queue
            .push(&TaskDescriptor::new("second", TaskSource::Api, "b"))
            .await
            .unwrap();
        assert_eq!(queue.len().await.unwrap(), 2);

        let first = queue.pop(Duration::from_millis(10)).await.unwrap().unwrap();
        let second = queue.pop(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.task_id, "first");
        assert_eq!(second.task_id, "second");
        assert!(queue.pop(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_entry_is_rejected() {
        let temp = TempDir::new().unwrap();
        let queue = DirWorkQueue::new(temp.path()).unwrap();
        std::fs::write(temp.path().join("0001-bad.json"), "{not json").unwrap();
        queue
            .push(&TaskDescriptor::new("good", TaskSource::Api, "a"))
            .await
            .unwrap();

        let item = queue.pop(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(item.task_id, "good");
        assert!(temp.path().join("rejected").join("0001-bad.json").exists());
    }

    #[tokio::test]
    async fn test_non_utf8_entry_is_rejected_not_stranded() {
        let temp = TempDir::new().unwrap();
        let queue = DirWorkQueue::new(temp.path()).unwrap();
        std::fs::write(temp.path().join("0001.json"), [0xff, 0xfe, 0x00]).unwrap();

        assert!(queue.pop(Duration::from_millis(50)).await.unwrap().is_none());

        let count = |dir: &str| std::fs::read_dir(temp.path().join(dir)).unwrap().count();
        assert_eq!(count("claimed"), 0);
        assert_eq!(count("rejected"), 1);
        assert!(temp.path().join("rejected").join("0001.json").exists());
    }
}
