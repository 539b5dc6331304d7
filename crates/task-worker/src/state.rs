//! Application state

use std::sync::Arc;

use relay_core::queue::WorkQueue;
use relay_core::task::TaskRepository;

use crate::posting::CommentLedger;
use crate::worker::TaskWorker;

/// Shared state of the worker's ops API
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    worker: TaskWorker,
}

impl AppState {
    pub fn new(worker: TaskWorker) -> Self {
        Self {
            inner: Arc::new(AppStateInner { worker }),
        }
    }

    pub fn worker(&self) -> &TaskWorker {
        &self.inner.worker
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.inner.worker.deps().queue
    }

    pub fn task_store(&self) -> &Arc<dyn TaskRepository> {
        &self.inner.worker.deps().tasks
    }

    pub fn ledger(&self) -> &CommentLedger {
        &self.inner.worker.deps().ledger
    }
}
