use crate::run::{NodeStatus, RunId};
use crate::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A structural or configuration problem found before a run starts.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("Graph has no nodes")]
    EmptyGraph,

    #[error("Duplicate node id: '{node_id}'")]
    DuplicateNode { node_id: NodeId },

    #[error("Edge {source_id} -> {target_id} references unknown node '{missing}'")]
    DanglingEdge {
        source_id: NodeId,
        target_id: NodeId,
        missing: NodeId,
    },

    #[error("Edge {node_id} -> {node_id} is a self-loop")]
    SelfLoop { node_id: NodeId },

    #[error("Duplicate edge {source_id} -> {target_id}")]
    DuplicateEdge { source_id: NodeId, target_id: NodeId },

    #[error("Edge {source_id} -> {target_id} leaves conditional node '{source_id}' without a branch label")]
    MissingBranchLabel { source_id: NodeId, target_id: NodeId },

    #[error("Edge {source_id} -> {target_id} has branch label '{label}' but '{source_id}' is not a conditional node")]
    UnexpectedBranchLabel {
        source_id: NodeId,
        target_id: NodeId,
        label: String,
    },

    #[error("Edge {source_id} -> {target_id} has invalid branch label '{label}' (expected 'true' or 'false')")]
    InvalidBranchLabel {
        source_id: NodeId,
        target_id: NodeId,
        label: String,
    },

    #[error("Node '{node_id}' has unknown node type '{node_type}'")]
    UnknownNodeType { node_id: NodeId, node_type: String },

    #[error("Node '{node_id}' is missing required config key '{key}'")]
    MissingConfig { node_id: NodeId, key: String },

    #[error("Node '{node_id}' has invalid config key '{key}': {reason}")]
    InvalidConfig {
        node_id: NodeId,
        key: String,
        reason: String,
    },

    #[error("Cycle detected between nodes: {}", .nodes.join(", "))]
    Cycle { nodes: Vec<NodeId> },

    #[error("Graph has no root nodes")]
    NoRootNodes,
}

/// Ordered list of every violation found in one validation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} validation error(s)", self.0.len())?;
        for err in &self.0 {
            write!(f, "; {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

impl From<Vec<ValidationError>> for ValidationErrors {
    fn from(errors: Vec<ValidationError>) -> Self {
        Self(errors)
    }
}

/// Classification of a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Validation,
    UpstreamRejection,
    Internal,
    Cancelled,
}

impl ErrorKind {
    /// Whether a per-node retry policy may re-attempt after this kind of failure.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::UpstreamRejection | ErrorKind::Internal
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Validation => "validation",
            ErrorKind::UpstreamRejection => "upstream_rejection",
            ErrorKind::Internal => "internal",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Failure reported by a step executor; kept verbatim on the node result.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(after_ms: u64) -> Self {
        Self::new(ErrorKind::Timeout, format!("Timed out after {}ms", after_ms))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamRejection, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Cancelled")
    }
}

/// Faults in the engine itself; any of these fails the whole run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Illegal transition for node '{node_id}': {from} -> {to}")]
    IllegalTransition {
        node_id: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },

    #[error("No executor registered for node type '{node_type}' (node '{node_id}')")]
    UnknownNodeType { node_id: NodeId, node_type: String },

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Run {0} has already finished")]
    RunFinished(RunId),

    #[error("Step task failed: {0}")]
    TaskJoin(String),
}
