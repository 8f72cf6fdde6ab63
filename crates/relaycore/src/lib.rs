//! Core abstractions for the relay workflow engine
//!
//! This crate provides the graph model, validation, typed node configuration,
//! the step executor capability trait and the run/event data types that the
//! runtime and the node library depend on.

pub mod config;
mod error;
pub mod events;
mod executor;
mod graph;
mod run;
mod validate;

pub use config::{
    Condition, DelayConfig, HttpCallConfig, HttpMethod, IntegrationConfig, ModelCallConfig,
    NodeConfig, Operator, Transform, TriggerConfig,
};
pub use error::{EngineError, ErrorKind, ExecutionError, ValidationError, ValidationErrors};
pub use events::{EventBus, EventEmitter, EventKind, EventSink, NodeMessage, RunEvent};
pub use executor::{ExecutorMetadata, StepContext, StepExecutor, StepInput, StepOutput};
pub use graph::{Edge, Graph, GraphId, NodeId, NodeKind, NodeSpec, RetryPolicy};
pub use run::{NodeErrorDetail, NodeResult, NodeStatus, RunId, RunStatus, RunView};
pub use validate::{validate, Node, NodeTypeCatalog, ValidGraph, BRANCH_FALSE, BRANCH_TRUE};
