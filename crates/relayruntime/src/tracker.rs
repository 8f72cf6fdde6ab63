//! Run Tracker: the single owner of one run's mutable state.
//!
//! Every transition takes the write lock once, updates the node result and
//! appends the matching event, so the event log order is the transition order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relaycore::{
    EngineError, EventKind, EventSink, ExecutionError, NodeErrorDetail, NodeId, NodeMessage,
    NodeResult, NodeStatus, RunEvent, RunId, RunStatus, RunView, StepOutput, ValidGraph,
};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, RwLock};

struct RunState {
    graph_id: String,
    graph_name: String,
    status: RunStatus,
    started_at: DateTime<Utc>,
    started: Instant,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
    nodes: BTreeMap<NodeId, NodeResult>,
    events: Vec<RunEvent>,
}

pub struct RunTracker {
    run_id: RunId,
    state: RwLock<RunState>,
    live: broadcast::Sender<RunEvent>,
    bus: Option<broadcast::Sender<RunEvent>>,
    status_tx: watch::Sender<RunStatus>,
}

impl RunTracker {
    pub fn new(
        run_id: RunId,
        graph: &ValidGraph,
        buffer: usize,
        bus: Option<broadcast::Sender<RunEvent>>,
    ) -> Self {
        let nodes = graph
            .nodes()
            .iter()
            .map(|n| (n.id.clone(), NodeResult::idle()))
            .collect();
        let (live, _) = broadcast::channel(buffer.max(1));
        let (status_tx, _) = watch::channel(RunStatus::Pending);

        Self {
            run_id,
            state: RwLock::new(RunState {
                graph_id: graph.id().clone(),
                graph_name: graph.name().to_string(),
                status: RunStatus::Pending,
                started_at: Utc::now(),
                started: Instant::now(),
                finished_at: None,
                error: None,
                nodes,
                events: Vec::new(),
            }),
            live,
            bus,
            status_tx,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    fn push_event(&self, state: &mut RunState, kind: EventKind) {
        let event = RunEvent {
            seq: state.events.len() as u64,
            run_id: self.run_id,
            timestamp: Utc::now(),
            kind,
        };
        state.events.push(event.clone());
        // Receivers may lag or be absent; the log stays authoritative.
        let _ = self.live.send(event.clone());
        if let Some(bus) = &self.bus {
            let _ = bus.send(event);
        }
    }

    /// Pending -> Running.
    pub async fn start(&self) {
        let mut state = self.state.write().await;
        if state.status != RunStatus::Pending {
            return;
        }
        state.status = RunStatus::Running;
        let kind = EventKind::RunStarted {
            graph_id: state.graph_id.clone(),
            node_count: state.nodes.len(),
        };
        self.push_event(&mut state, kind);
        self.status_tx.send_replace(RunStatus::Running);
    }

    async fn transition(
        &self,
        node_id: &str,
        to: NodeStatus,
        apply: impl FnOnce(&mut NodeResult),
    ) -> Result<(), EngineError> {
        let mut state = self.state.write().await;
        if state.status.is_terminal() {
            return Err(EngineError::RunFinished(self.run_id));
        }
        let result = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| EngineError::NodeNotFound(node_id.to_string()))?;
        if !result.status.can_transition_to(to) {
            return Err(EngineError::IllegalTransition {
                node_id: node_id.to_string(),
                from: result.status,
                to,
            });
        }
        result.status = to;
        apply(result);
        let kind = EventKind::NodeStatusChanged {
            node_id: node_id.to_string(),
            status: to,
            error: result.error.clone(),
            branch: result.branch.clone(),
        };
        self.push_event(&mut state, kind);
        Ok(())
    }

    pub async fn mark_running(&self, node_id: &str) -> Result<(), EngineError> {
        self.transition(node_id, NodeStatus::Running, |r| {
            r.started_at = Some(Utc::now());
            r.attempts = 1;
        })
        .await
    }

    pub async fn mark_succeeded(&self, node_id: &str, output: StepOutput) -> Result<(), EngineError> {
        self.transition(node_id, NodeStatus::Succeeded, |r| {
            r.output = Some(output.value);
            r.branch = output.branch;
            r.finished_at = Some(Utc::now());
        })
        .await
    }

    pub async fn mark_failed(&self, node_id: &str, error: ExecutionError) -> Result<(), EngineError> {
        self.transition(node_id, NodeStatus::Failed, |r| {
            r.error = Some(NodeErrorDetail::from(error));
            r.finished_at = Some(Utc::now());
        })
        .await
    }

    pub async fn mark_skipped(&self, node_id: &str, reason: impl Into<String>) -> Result<(), EngineError> {
        let reason = reason.into();
        self.transition(node_id, NodeStatus::Skipped, |r| {
            r.skip_reason = Some(reason);
            r.finished_at = Some(Utc::now());
        })
        .await
    }

    /// Records a failed attempt that will be retried; the node stays running.
    pub async fn mark_retrying(
        &self,
        node_id: &str,
        failed_attempt: u32,
        delay: Duration,
        error: &ExecutionError,
    ) -> Result<(), EngineError> {
        let mut state = self.state.write().await;
        if state.status.is_terminal() {
            return Err(EngineError::RunFinished(self.run_id));
        }
        let result = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| EngineError::NodeNotFound(node_id.to_string()))?;
        if result.status != NodeStatus::Running {
            return Err(EngineError::IllegalTransition {
                node_id: node_id.to_string(),
                from: result.status,
                to: NodeStatus::Running,
            });
        }
        result.attempts = failed_attempt + 1;
        let kind = EventKind::NodeRetrying {
            node_id: node_id.to_string(),
            attempt: failed_attempt,
            delay_ms: delay.as_millis() as u64,
            error: NodeErrorDetail::from(error.clone()),
        };
        self.push_event(&mut state, kind);
        Ok(())
    }

    /// Moves the run to a terminal status. Returns false if it already was terminal.
    pub async fn finish(&self, status: RunStatus, error: Option<String>) -> bool {
        debug_assert!(status.is_terminal());
        let mut state = self.state.write().await;
        if state.status.is_terminal() {
            return false;
        }
        state.status = status;
        state.error = error;
        state.finished_at = Some(Utc::now());
        let duration_ms = state.started.elapsed().as_millis() as u64;
        self.push_event(&mut state, EventKind::RunFinished { status, duration_ms });
        self.status_tx.send_replace(status);
        true
    }

    pub async fn status(&self) -> RunStatus {
        self.state.read().await.status
    }

    pub async fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.state.read().await.nodes.get(node_id).map(|r| r.status)
    }

    /// Consistent copy of the run at this moment.
    pub async fn snapshot(&self) -> RunView {
        let state = self.state.read().await;
        RunView {
            run_id: self.run_id,
            graph_id: state.graph_id.clone(),
            graph_name: state.graph_name.clone(),
            status: state.status,
            started_at: state.started_at,
            finished_at: state.finished_at,
            error: state.error.clone(),
            nodes: state.nodes.clone(),
        }
    }

    /// Events with `seq >= since`.
    pub async fn events_since(&self, since: u64) -> Vec<RunEvent> {
        let state = self.state.read().await;
        state.events.iter().skip(since as usize).cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.live.subscribe()
    }

    /// The log so far plus a receiver for everything after it, with no gap or overlap.
    pub async fn subscribe_with_backlog(&self) -> (Vec<RunEvent>, broadcast::Receiver<RunEvent>) {
        let state = self.state.read().await;
        let receiver = self.live.subscribe();
        (state.events.clone(), receiver)
    }

    /// Resolves once the run is terminal.
    pub async fn wait_terminal(&self) -> RunView {
        let mut status_rx = self.status_tx.subscribe();
        // The sender lives as long as `self`, so this only errors if we are being dropped.
        let _ = status_rx.wait_for(|s| s.is_terminal()).await;
        self.snapshot().await
    }
}

#[async_trait]
impl EventSink for RunTracker {
    async fn node_message(&self, node_id: &NodeId, message: NodeMessage) {
        let mut state = self.state.write().await;
        if state.status.is_terminal() {
            return;
        }
        let kind = EventKind::NodeMessage {
            node_id: node_id.clone(),
            message,
        };
        self.push_event(&mut state, kind);
    }
}
