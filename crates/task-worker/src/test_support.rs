//! Inert collaborators for tests that only need a constructed worker

use std::sync::Arc;

use agent_runner::{AgentRunner, ExecutionResult, RunRequest, RunnerEvent};
use async_trait::async_trait;
use relay_core::output_store::OutputStore;
use relay_core::queue::MemoryWorkQueue;
use relay_core::stream::{EventPublisher, MemoryEventStream};
use relay_core::task::{FileTaskStore, Task};
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::notify::Notifier;
use crate::posting::{CommentLedger, PostOutcome, ResponsePoster};
use crate::{TaskWorker, WorkerConfig, WorkerDeps};

struct EchoRunner;

#[async_trait]
impl AgentRunner for EchoRunner {
    async fn run(
        &self,
        request: RunRequest,
        _sink: Option<mpsc::Sender<RunnerEvent>>,
    ) -> ExecutionResult {
        ExecutionResult {
            success: true,
            output: request.prompt.clone(),
            clean_output: request.prompt,
            exit_code: Some(0),
            ..Default::default()
        }
    }
}

struct NoPoster;

#[async_trait]
impl ResponsePoster for NoPoster {
    async fn post(&self, _task: &Task, _body: &str, _success: bool) -> Result<PostOutcome> {
        Ok(PostOutcome::default())
    }
}

struct NoNotifier;

#[async_trait]
impl Notifier for NoNotifier {
    async fn notify(&self, _task: &Task, _output: &str) -> Result<bool> {
        Ok(false)
    }
}

/// A worker over in-memory queue and stream that is not pulling work
pub(crate) async fn idle_worker(max_concurrent: usize) -> (TaskWorker, TempDir) {
    let dir = TempDir::new().unwrap();
    let tasks = FileTaskStore::new(dir.path().join("tasks.json"))
        .await
        .unwrap();
    let config = WorkerConfig {
        data_dir: dir.path().to_path_buf(),
        max_concurrent_tasks: max_concurrent,
        default_repo_path: dir.path().to_path_buf(),
        ..Default::default()
    };
    let deps = WorkerDeps {
        queue: Arc::new(MemoryWorkQueue::new()),
        publisher: EventPublisher::new(Arc::new(MemoryEventStream::new())),
        tasks: Arc::new(tasks),
        outputs: OutputStore::new(dir.path()),
        runner: Arc::new(EchoRunner),
        context: None,
        poster: Arc::new(NoPoster),
        notifier: Arc::new(NoNotifier),
        ledger: Arc::new(CommentLedger::default()),
    };
    (TaskWorker::new(config, deps), dir)
}
