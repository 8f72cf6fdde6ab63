//! Workflow execution runtime
//!
//! This crate runs validated graphs: the integration registry, the scheduler
//! that dispatches ready nodes in parallel, and the run tracker that owns each
//! run's state and event log.

mod config;
mod error;
mod registry;
mod runtime;
mod scheduler;
mod tracker;

pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError};
pub use registry::IntegrationRegistry;
pub use runtime::{RelayRuntime, RunSummary};
pub use scheduler::{CancelOutcome, RunHandle, Scheduler};
pub use tracker::RunTracker;
