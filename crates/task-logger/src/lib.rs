//! Task Logger - turns the event stream into per-task log directories
//!
//! A single correlator consumes the stream through a consumer group, holds
//! webhook events until their task is known and writes each task's
//! metadata, input, journals and final result under `LOGS_DIR`. A small
//! ops API serves assembled logs and consumer metrics.

pub mod config;
pub mod correlation;
pub mod correlator;
pub mod error;
pub mod handlers;
pub mod registry;
pub mod routes;
pub mod state;
pub mod task_log;

pub use config::LoggerConfig;
pub use correlator::{Correlator, CorrelatorMetrics};
pub use error::{LoggerError, Result};
