//! Agent Runner - drives coding-agent CLI subprocesses
//!
//! This crate spawns one vendor agent CLI per task, reads its stdout and
//! stderr concurrently, decodes the vendor's streaming JSON protocol and folds
//! everything into a normalized [`ExecutionResult`].

mod accumulator;
mod error;
mod provider;
mod result;
mod runner;
pub mod sanitize;

pub use error::{Result, RunnerError};
pub use provider::{ProviderKind, ProviderOptions};
pub use result::{ExecutionResult, RunnerEvent, ThinkingBlock, ToolEvent};
pub use runner::{AgentRunner, CliRunner, RunRequest, RunnerConfig, DEFAULT_TIMEOUT_SECONDS};
