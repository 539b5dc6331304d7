//! Durable stream backed by a JSONL file
//!
//! Layout:
//! ```text
//! {dir}/
//!   events.jsonl       # one entry per line; the line number is the entry id
//!   groups/{name}.json # cursor and pending set of each consumer group
//! ```
//!
//! Ids are assigned by line position, so every process that reads the file
//! agrees on them. The byte offset of each complete line is indexed lazily as
//! the file grows; a trailing line without a newline is not yet visible. The
//! stream assumes a single writing process: a torn tail left by a writer that
//! died mid-line is cut off before the next append.
//!
//! File I/O runs on the blocking pool.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{EntryId, EventStream, EventStreamEntry, GroupInfo, GroupState, StreamEntry};
use crate::fsutil::{read_json, write_json_atomic};
use crate::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct FileState {
    /// Byte offset of each complete line; entry id `n` lives at `offsets[n - 1]`
    offsets: Vec<u64>,
    indexed_len: u64,
    groups: HashMap<String, GroupState>,
}

/// The synchronous side of the stream; every method takes the state lock
struct StreamLog {
    dir: PathBuf,
    state: Mutex<FileState>,
}

pub struct FileEventStream {
    log: Arc<StreamLog>,
}

impl StreamLog {
    fn lock(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("events.jsonl")
    }

    fn group_path(&self, group: &str) -> PathBuf {
        self.dir.join("groups").join(format!("{}.json", group))
    }

    /// Index lines appended since the last refresh
    fn refresh(&self, state: &mut FileState) -> Result<()> {
        let file = match File::open(self.log_path()) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if file.metadata()?.len() <= state.indexed_len {
            return Ok(());
        }

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(state.indexed_len))?;
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line)?;
            if read == 0 || line.last() != Some(&b'\n') {
                break;
            }
            state.offsets.push(state.indexed_len);
            state.indexed_len += read as u64;
        }
        Ok(())
    }

    fn read_entries(
        &self,
        state: &FileState,
        ids: &[u64],
    ) -> Result<Vec<(u64, Option<EventStreamEntry>)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut reader = BufReader::new(File::open(self.log_path())?);
        let mut out = Vec::with_capacity(ids.len());
        let mut line = String::new();
        for &id in ids {
            let Some(offset) = state.offsets.get((id - 1) as usize) else {
                out.push((id, None));
                continue;
            };
            reader.seek(SeekFrom::Start(*offset))?;
            line.clear();
            reader.read_line(&mut line)?;
            match serde_json::from_str(line.trim_end()) {
                Ok(entry) => out.push((id, Some(entry))),
                Err(e) => {
                    warn!("Unreadable stream entry {}: {}", id, e);
                    out.push((id, None));
                }
            }
        }
        Ok(out)
    }

    /// Turn claimed ids into entries. Ids whose line cannot be decoded are
    /// acknowledged on the spot so they do not stay pending forever.
    fn resolve(
        &self,
        state: &mut FileState,
        group: &str,
        ids: Vec<u64>,
    ) -> Result<Vec<StreamEntry>> {
        let mut entries = Vec::with_capacity(ids.len());
        let mut unreadable = Vec::new();
        for (id, entry) in self.read_entries(state, &ids)? {
            match entry {
                Some(entry) => entries.push(StreamEntry {
                    id: EntryId(id),
                    entry,
                }),
                None => unreadable.push(EntryId(id)),
            }
        }
        if !unreadable.is_empty() {
            group_mut(state, group)?.ack(&unreadable);
        }
        self.save_group(state, group)?;
        Ok(entries)
    }

    fn load_group(&self, state: &mut FileState, group: &str) -> Result<()> {
        if state.groups.contains_key(group) {
            return Ok(());
        }
        if let Some(saved) = read_json::<GroupState>(&self.group_path(group))? {
            state.groups.insert(group.to_string(), saved);
        }
        Ok(())
    }

    fn save_group(&self, state: &FileState, group: &str) -> Result<()> {
        if let Some(group_state) = state.groups.get(group) {
            write_json_atomic(&self.group_path(group), group_state)?;
        }
        Ok(())
    }

    fn append(&self, line: &[u8]) -> Result<EntryId> {
        let mut state = self.lock();
        self.refresh(&mut state)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        let len = file.metadata()?.len();
        if len > state.indexed_len {
            warn!(
                torn_bytes = len - state.indexed_len,
                "Cutting off an unterminated line left by an earlier writer"
            );
            file.set_len(state.indexed_len)?;
        }
        file.write_all(line)?;
        file.flush()?;
        self.refresh(&mut state)?;
        Ok(EntryId(state.offsets.len() as u64))
    }

    fn ensure_group(&self, group: &str) -> Result<bool> {
        let mut state = self.lock();
        self.load_group(&mut state, group)?;
        if state.groups.contains_key(group) {
            return Ok(false);
        }
        state.groups.insert(group.to_string(), GroupState::default());
        self.save_group(&state, group)?;
        debug!("Created consumer group {} in {}", group, self.dir.display());
        Ok(true)
    }

    /// Claim up to `count` undelivered entries without waiting
    fn claim(&self, group: &str, consumer: &str, count: usize) -> Result<Vec<StreamEntry>> {
        let mut state = self.lock();
        self.load_group(&mut state, group)?;
        self.refresh(&mut state)?;
        let total = state.offsets.len() as u64;
        let ids = group_mut(&mut state, group)?.claim_next(total, count, consumer);
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.resolve(&mut state, group, ids)
    }

    fn pending(&self, group: &str, consumer: &str, count: usize) -> Result<Vec<StreamEntry>> {
        let mut state = self.lock();
        self.load_group(&mut state, group)?;
        self.refresh(&mut state)?;
        let ids = group_mut(&mut state, group)?.redeliver(consumer, count);
        self.resolve(&mut state, group, ids)
    }

    fn ack(&self, group: &str, ids: &[EntryId]) -> Result<usize> {
        let mut state = self.lock();
        self.load_group(&mut state, group)?;
        let acked = group_mut(&mut state, group)?.ack(ids);
        if acked > 0 {
            self.save_group(&state, group)?;
        }
        Ok(acked)
    }

    fn len(&self) -> Result<u64> {
        let mut state = self.lock();
        self.refresh(&mut state)?;
        Ok(state.offsets.len() as u64)
    }

    fn group_info(&self, group: &str) -> Result<GroupInfo> {
        let mut state = self.lock();
        self.load_group(&mut state, group)?;
        self.refresh(&mut state)?;
        let total = state.offsets.len() as u64;
        Ok(group_mut(&mut state, group)?.info(group, total))
    }
}

fn group_mut<'a>(state: &'a mut FileState, group: &str) -> Result<&'a mut GroupState> {
    state
        .groups
        .get_mut(group)
        .ok_or_else(|| Error::Stream(format!("No such consumer group: {}", group)))
}

fn validate_group_name(group: &str) -> Result<()> {
    let valid = !group.is_empty()
        && group
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("Invalid group name: {:?}", group)))
    }
}

impl FileEventStream {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(dir.join("groups"))?;
        Ok(Self {
            log: Arc::new(StreamLog {
                dir,
                state: Mutex::new(FileState::default()),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.log.dir
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&StreamLog) -> Result<T> + Send + 'static,
    {
        let log = Arc::clone(&self.log);
        tokio::task::spawn_blocking(move || op(log.as_ref()))
            .await
            .map_err(std::io::Error::other)?
    }
}

#[async_trait]
impl EventStream for FileEventStream {
    async fn append(&self, entry: EventStreamEntry) -> Result<EntryId> {
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        self.blocking(move |log| log.append(&line)).await
    }

    async fn ensure_group(&self, group: &str) -> Result<bool> {
        validate_group_name(group)?;
        let group = group.to_string();
        self.blocking(move |log| log.ensure_group(&group)).await
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
            let (g, c) = (group.to_string(), consumer.to_string());
            let entries = self.blocking(move |log| log.claim(&g, &c, count)).await?;
            if !entries.is_empty() {
                return Ok(entries);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn pending(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let (group, consumer) = (group.to_string(), consumer.to_string());
        self.blocking(move |log| log.pending(&group, &consumer, count))
            .await
    }

    async fn ack(&self, group: &str, ids: &[EntryId]) -> Result<usize> {
        let (group, ids) = (group.to_string(), ids.to_vec());
        self.blocking(move |log| log.ack(&group, &ids)).await
    }

    async fn len(&self) -> Result<u64> {
        self.blocking(|log| log.len()).await
    }

    async fn group_info(&self, group: &str) -> Result<GroupInfo> {
        let group = group.to_string();
        self.blocking(move |log| log.group_info(&group)).await
    }
}
