//! Per-task log directory
//!
//! Layout:
//! ```text
//! <logs_dir>/
//!   .by-id/<task_id>                -> ../<dir>   (pointer file off unix)
//!   2026-01-05_14-03-22_jira_3f2a9c1e/
//!     metadata.json                  # replaced atomically, enriched over time
//!     01-input.json
//!     02-user-inputs.jsonl
//!     03-webhook-flow.jsonl
//!     04-agent-output.jsonl
//!     05-knowledge-interactions.jsonl
//!     06-final-result.json           # written once
//!     07-response-posting.jsonl
//!     .applied                       # stream entry ids already written here
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use relay_core::fsutil::{append_jsonl, read_json, read_jsonl, write_json_atomic};
use relay_core::stream::EntryId;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{LoggerError, Result};

pub const INDEX_DIR: &str = ".by-id";

const METADATA_FILE: &str = "metadata.json";
const INPUT_FILE: &str = "01-input.json";
const USER_INPUTS_FILE: &str = "02-user-inputs.jsonl";
const WEBHOOK_FLOW_FILE: &str = "03-webhook-flow.jsonl";
const AGENT_OUTPUT_FILE: &str = "04-agent-output.jsonl";
const KNOWLEDGE_FILE: &str = "05-knowledge-interactions.jsonl";
const FINAL_RESULT_FILE: &str = "06-final-result.json";
const RESPONSE_POSTING_FILE: &str = "07-response-posting.jsonl";
const APPLIED_FILE: &str = ".applied";

/// `YYYY-MM-DD_HH-MM-SS[_source]_<first 8 chars of the id>`
pub fn dir_name(task_id: &str, source: Option<&str>, at: DateTime<Utc>) -> String {
    let short_id: String = task_id.chars().take(8).collect();
    let source_tag = source
        .filter(|s| !s.is_empty())
        .map(|s| format!("_{}", s))
        .unwrap_or_default();
    format!("{}{}_{}", at.format("%Y-%m-%d_%H-%M-%S"), source_tag, short_id)
}

fn validate_task_id(task_id: &str) -> Result<()> {
    let plain = !task_id.is_empty()
        && task_id != "."
        && task_id != ".."
        && !task_id.contains(['/', '\\', '\0']);
    if plain {
        Ok(())
    } else {
        Err(LoggerError::InvalidTaskId(task_id.to_string()))
    }
}

fn index_path(logs_dir: &Path, task_id: &str) -> PathBuf {
    logs_dir.join(INDEX_DIR).join(task_id)
}

/// Directory already assigned to `task_id`, if any
pub fn resolve(logs_dir: &Path, task_id: &str) -> Option<PathBuf> {
    validate_task_id(task_id).ok()?;
    let link = index_path(logs_dir, task_id);
    let target = match fs::read_link(&link) {
        Ok(target) => target,
        Err(_) => PathBuf::from(fs::read_to_string(&link).ok()?.trim()),
    };
    let resolved = target
        .file_name()
        .map(|name| logs_dir.join(name))
        .filter(|dir| dir.is_dir());
    resolved.or_else(|| {
        let direct = logs_dir.join(task_id);
        direct.is_dir().then_some(direct)
    })
}

#[cfg(unix)]
fn write_index(link: &Path, dir_name: &str) -> std::io::Result<()> {
    std::os::unix::fs::symlink(Path::new("..").join(dir_name), link)
}

#[cfg(not(unix))]
fn write_index(link: &Path, dir_name: &str) -> std::io::Result<()> {
    fs::write(link, dir_name)
}

/// Write handle for one task's log directory
#[derive(Debug)]
pub struct TaskLog {
    task_id: String,
    dir: PathBuf,
    applied: HashSet<u64>,
}

impl TaskLog {
    /// Open the task's directory, creating it (and its index entry) on first
    /// use. A directory already indexed for the task is reused.
    pub fn open(logs_dir: &Path, task_id: &str, source: Option<&str>) -> Result<Self> {
        validate_task_id(task_id)?;

        let dir = match resolve(logs_dir, task_id) {
            Some(dir) => dir,
            None => {
                let name = dir_name(task_id, source, Utc::now());
                let dir = logs_dir.join(&name);
                fs::create_dir_all(&dir)?;

                let link = index_path(logs_dir, task_id);
                fs::create_dir_all(logs_dir.join(INDEX_DIR))?;
                if fs::symlink_metadata(&link).is_ok() {
                    fs::remove_file(&link)?;
                }
                if let Err(e) = write_index(&link, &name) {
                    warn!(%task_id, "Failed to index log directory: {}", e);
                }
                debug!(%task_id, dir = %dir.display(), "Created task log directory");
                dir
            }
        };

        let applied = read_jsonl::<u64>(&dir.join(APPLIED_FILE))?
            .into_iter()
            .collect();
        Ok(Self {
            task_id: task_id.to_string(),
            dir,
            applied,
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether the stream entry was already written into this directory
    pub fn is_applied(&self, id: EntryId) -> bool {
        self.applied.contains(&id.0)
    }

    pub fn mark_applied(&mut self, id: EntryId) -> Result<()> {
        if self.applied.insert(id.0) {
            append_jsonl(&self.dir.join(APPLIED_FILE), &id.0)?;
        }
        Ok(())
    }

    pub fn write_metadata(&self, metadata: &Value) -> Result<()> {
        Ok(write_json_atomic(&self.dir.join(METADATA_FILE), metadata)?)
    }

    pub fn write_input(&self, input: &Value) -> Result<()> {
        Ok(write_json_atomic(&self.dir.join(INPUT_FILE), input)?)
    }

    /// Merge non-null `fields` into `metadata.json`
    pub fn enrich_metadata(&self, fields: Value) -> Result<()> {
        self.enrich(METADATA_FILE, fields)
    }

    /// Merge non-null `fields` into `01-input.json`
    pub fn enrich_input(&self, fields: Value) -> Result<()> {
        self.enrich(INPUT_FILE, fields)
    }

    fn enrich(&self, file: &str, fields: Value) -> Result<()> {
        let path = self.dir.join(file);
        let mut document: Map<String, Value> = read_json(&path)?.unwrap_or_default();
        if let Value::Object(fields) = fields {
            for (key, value) in fields {
                if !value.is_null() {
                    document.insert(key, value);
                }
            }
        }
        Ok(write_json_atomic(&path, &document)?)
    }

    pub fn append_user_input(&self, record: &Value) -> Result<()> {
        self.append(USER_INPUTS_FILE, record)
    }

    pub fn append_webhook_event(&self, record: &Value) -> Result<()> {
        self.append(WEBHOOK_FLOW_FILE, record)
    }

    pub fn append_agent_output(&self, record: &Value) -> Result<()> {
        self.append(AGENT_OUTPUT_FILE, record)
    }

    pub fn append_knowledge_interaction(&self, record: &Value) -> Result<()> {
        self.append(KNOWLEDGE_FILE, record)
    }

    pub fn append_response_posting(&self, record: &Value) -> Result<()> {
        self.append(RESPONSE_POSTING_FILE, record)
    }

    fn append(&self, file: &str, record: &Value) -> Result<()> {
        Ok(append_jsonl(&self.dir.join(file), record)?)
    }

    /// Write `06-final-result.json`. Returns `false`, leaving the file as it
    /// is, when a final result was already recorded.
    pub fn write_final_result(&self, result: &Value) -> Result<bool> {
        let path = self.dir.join(FINAL_RESULT_FILE);
        if path.exists() {
            warn!(task_id = %self.task_id, "Final result already written, ignoring");
            return Ok(false);
        }
        write_json_atomic(&path, result)?;
        Ok(true)
    }

    pub fn final_result(&self) -> Result<Option<Value>> {
        Ok(read_json(&self.dir.join(FINAL_RESULT_FILE))?)
    }
}

/// Everything recorded for a task, keyed by section. Missing files are
/// left out.
pub fn assemble(dir: &Path) -> Result<Value> {
    let mut logs = Map::new();

    for (key, file) in [
        ("metadata", METADATA_FILE),
        ("input", INPUT_FILE),
        ("final_result", FINAL_RESULT_FILE),
    ] {
        if let Some(document) = read_json::<Value>(&dir.join(file))? {
            logs.insert(key.to_string(), document);
        }
    }

    for (key, file) in [
        ("user_inputs", USER_INPUTS_FILE),
        ("webhook_flow", WEBHOOK_FLOW_FILE),
        ("agent_output", AGENT_OUTPUT_FILE),
        ("knowledge_interactions", KNOWLEDGE_FILE),
        ("response_posting", RESPONSE_POSTING_FILE),
    ] {
        let path = dir.join(file);
        if path.exists() {
            logs.insert(key.to_string(), Value::Array(read_jsonl(&path)?));
        }
    }

    Ok(Value::Object(logs))
}

/// Number of task directories under `logs_dir`
pub fn count_task_dirs(logs_dir: &Path) -> Result<usize> {
    let entries = match fs::read_dir(logs_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut count = 0;
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() && entry.file_name() != INDEX_DIR {
            count += 1;
        }
    }
    Ok(count)
}
