//! Work queue
//!
//! A FIFO of task descriptors. Consumers pop with a short timeout so their
//! loops stay responsive to shutdown.

mod dir;
mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::task::TaskDescriptor;
use crate::Result;

pub use dir::DirWorkQueue;
pub use memory::MemoryWorkQueue;

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Append a descriptor at the tail
    async fn push(&self, descriptor: &TaskDescriptor) -> Result<()>;

    /// Take the head, waiting at most `timeout` for one to arrive
    async fn pop(&self, timeout: Duration) -> Result<Option<TaskDescriptor>>;

    /// Number of descriptors waiting
    async fn len(&self) -> Result<usize>;
}
