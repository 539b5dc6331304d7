//! Open log handles, one per live task

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;
use crate::task_log::TaskLog;

/// Handles are created on first use and dropped once the task's terminal
/// event is written. A task seen again later reopens its indexed directory.
#[derive(Debug)]
pub struct LogRegistry {
    logs_dir: PathBuf,
    handles: HashMap<String, TaskLog>,
    sources: HashMap<String, String>,
}

impl LogRegistry {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            handles: HashMap::new(),
            sources: HashMap::new(),
        }
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// Source tag used in the directory name of a task not opened yet
    pub fn remember_source(&mut self, task_id: &str, source: &str) {
        if !source.is_empty() {
            self.sources.insert(task_id.to_string(), source.to_string());
        }
    }

    pub fn get_or_open(&mut self, task_id: &str) -> Result<&mut TaskLog> {
        match self.handles.entry(task_id.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let source = self.sources.get(task_id).map(String::as_str);
                let log = TaskLog::open(&self.logs_dir, task_id, source)?;
                Ok(entry.insert(log))
            }
        }
    }

    pub fn evict(&mut self, task_id: &str) {
        self.sources.remove(task_id);
        if self.handles.remove(task_id).is_some() {
            debug!(%task_id, "Evicted task log handle");
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
