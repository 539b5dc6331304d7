//! Task module
//!
//! This module contains the task model, its lifecycle state machine, the
//! queue descriptor it is built from, and the external task store.

mod descriptor;
mod file_store;
mod model;
mod repository;

pub use descriptor::{SourceMetadata, TaskDescriptor};
pub use file_store::FileTaskStore;
pub use model::*;
pub use repository::TaskRepository;
