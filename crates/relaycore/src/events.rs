use crate::{NodeErrorDetail, NodeId, NodeStatus, RunId, RunStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// One entry of a run's append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// Position in the run's log, starting at 0.
    pub seq: u64,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RunStarted {
        graph_id: String,
        node_count: usize,
    },
    NodeStatusChanged {
        node_id: NodeId,
        status: NodeStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<NodeErrorDetail>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
    },
    NodeRetrying {
        node_id: NodeId,
        attempt: u32,
        delay_ms: u64,
        error: NodeErrorDetail,
    },
    NodeMessage {
        node_id: NodeId,
        message: NodeMessage,
    },
    RunFinished {
        status: RunStatus,
        duration_ms: u64,
    },
}

/// Progress reported by a step executor while it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "level", rename_all = "snake_case")]
pub enum NodeMessage {
    Info { message: String },
    Warning { message: String },
    Progress { percent: f64, message: Option<String> },
}

/// Destination for executor messages; the run tracker is the production sink.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn node_message(&self, node_id: &NodeId, message: NodeMessage);
}

/// Sink that only writes to the log; used for executors invoked outside a run.
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn node_message(&self, node_id: &NodeId, message: NodeMessage) {
        tracing::debug!(node_id = %node_id, ?message, "node message");
    }
}

/// Event emitter handed to a step executor for real-time updates.
#[derive(Clone)]
pub struct EventEmitter {
    node_id: NodeId,
    sink: Arc<dyn EventSink>,
}

impl EventEmitter {
    pub fn new(node_id: NodeId, sink: Arc<dyn EventSink>) -> Self {
        Self { node_id, sink }
    }

    pub fn detached(node_id: impl Into<NodeId>) -> Self {
        Self::new(node_id.into(), Arc::new(LogSink))
    }

    pub async fn emit(&self, message: NodeMessage) {
        self.sink.node_message(&self.node_id, message).await;
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.emit(NodeMessage::Info {
            message: message.into(),
        })
        .await;
    }

    pub async fn warn(&self, message: impl Into<String>) {
        self.emit(NodeMessage::Warning {
            message: message.into(),
        })
        .await;
    }

    pub async fn progress(&self, percent: f64, message: Option<String>) {
        self.emit(NodeMessage::Progress { percent, message }).await;
    }
}

/// Process-wide fan-out of every run's events.
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<RunEvent> {
        self.sender.clone()
    }
}
