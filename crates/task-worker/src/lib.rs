//! Task Worker - pulls task descriptors off the work queue and runs agents
//!
//! The worker bounds concurrency with a semaphore, drives each task through
//! its state machine, publishes lifecycle events and delivers results back
//! to the originating platform.

pub mod config;
pub mod conversation;
pub mod error;
pub mod notify;
pub mod posting;
pub mod routes;
pub mod routing;
pub mod state;
pub mod validation;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use config::WorkerConfig;
pub use error::{Result, WorkerError};
pub use worker::{TaskWorker, WorkerDeps};
