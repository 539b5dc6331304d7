//! Core library for the agent relay
//!
//! This crate contains the pieces shared by the worker and the log assembler:
//! - Task model and lifecycle state machine
//! - Work queue backends
//! - Event stream backends and the publisher
//! - File persistence helpers

pub mod error;
pub mod fsutil;
pub mod output_store;
pub mod queue;
pub mod stream;
pub mod task;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
