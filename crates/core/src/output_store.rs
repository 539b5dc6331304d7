//! Output persistence - keeps the agent output produced for each task
//!
//! Directory structure:
//! ```text
//! .relay-data/
//!   outputs/
//!     {task_id}/
//!       raw.log     # Full accumulated output, tool and log annotations included
//!       output.md   # Cleaned assistant output
//! ```

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::Result;

const RAW_FILE: &str = "raw.log";
const CLEAN_FILE: &str = "output.md";

/// Output store for persisting raw and cleaned task output
#[derive(Debug, Clone)]
pub struct OutputStore {
    base_dir: PathBuf,
}

impl OutputStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: data_dir.as_ref().join("outputs"),
        }
    }

    fn task_dir(&self, task_id: &str) -> PathBuf {
        self.base_dir.join(task_id)
    }

    /// Write both renditions of a task's output, replacing earlier ones
    pub async fn save(&self, task_id: &str, raw: &str, clean: &str) -> Result<PathBuf> {
        let dir = self.task_dir(task_id);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(RAW_FILE), raw).await?;
        tokio::fs::write(dir.join(CLEAN_FILE), clean).await?;
        debug!("Saved output for task {} to {}", task_id, dir.display());
        Ok(dir)
    }

    /// Load the cleaned output, `None` when nothing was saved
    pub async fn load_clean(&self, task_id: &str) -> Result<Option<String>> {
        self.load(task_id, CLEAN_FILE).await
    }

    /// Load the raw output, `None` when nothing was saved
    pub async fn load_raw(&self, task_id: &str) -> Result<Option<String>> {
        self.load(task_id, RAW_FILE).await
    }

    async fn load(&self, task_id: &str, file: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.task_dir(task_id).join(file)).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
