use crate::error::{Result, RuntimeError};
use crate::registry::IntegrationRegistry;
use crate::scheduler::{CancelOutcome, RunHandle, Scheduler};
use crate::RuntimeConfig;
use chrono::{DateTime, Utc};
use relaycore::{validate, EventBus, Graph, RunEvent, RunId, RunStatus, RunView, ValidGraph};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::info;

/// One line of a run listing.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub graph_id: String,
    pub graph_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&RunView> for RunSummary {
    fn from(view: &RunView) -> Self {
        Self {
            run_id: view.run_id,
            graph_id: view.graph_id.clone(),
            graph_name: view.graph_name.clone(),
            status: view.status,
            started_at: view.started_at,
            finished_at: view.finished_at,
        }
    }
}

/// Entry point for validating graphs and managing runs.
pub struct RelayRuntime {
    registry: Arc<IntegrationRegistry>,
    scheduler: Scheduler,
    event_bus: Arc<EventBus>,
    runs: Arc<RwLock<HashMap<RunId, RunHandle>>>,
}

impl RelayRuntime {
    pub fn new(registry: Arc<IntegrationRegistry>, config: RuntimeConfig) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let scheduler =
            Scheduler::new(registry.clone(), config).with_event_bus(event_bus.sender());

        Self {
            registry,
            scheduler,
            event_bus,
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &Arc<IntegrationRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.scheduler.config()
    }

    /// Validate a graph against the registered node types.
    pub fn validate(&self, graph: &Graph) -> Result<ValidGraph> {
        Ok(validate(graph, self.registry.as_ref())?)
    }

    /// Validate and start a graph. No run is created if validation fails.
    pub async fn submit(&self, graph: &Graph, input: Value) -> Result<RunHandle> {
        let valid = self.validate(graph)?;
        Ok(self.submit_valid(Arc::new(valid), input).await)
    }

    pub async fn submit_valid(&self, graph: Arc<ValidGraph>, input: Value) -> RunHandle {
        let handle = self.scheduler.run(graph, input);
        info!(run_id = %handle.id(), "run submitted");
        self.runs.write().await.insert(handle.id(), handle.clone());
        handle
    }

    pub async fn handle(&self, run_id: RunId) -> Result<RunHandle> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .cloned()
            .ok_or(RuntimeError::RunNotFound(run_id))
    }

    pub async fn status(&self, run_id: RunId) -> Result<RunView> {
        Ok(self.handle(run_id).await?.snapshot().await)
    }

    pub async fn cancel(&self, run_id: RunId) -> Result<CancelOutcome> {
        Ok(self.handle(run_id).await?.cancel().await)
    }

    /// Resolves when the run reaches a terminal status.
    pub async fn wait(&self, run_id: RunId) -> Result<RunView> {
        Ok(self.handle(run_id).await?.wait().await)
    }

    pub async fn events(&self, run_id: RunId, since: u64) -> Result<Vec<RunEvent>> {
        Ok(self.handle(run_id).await?.tracker().events_since(since).await)
    }

    /// Backlog plus live receiver for one run.
    pub async fn subscribe(
        &self,
        run_id: RunId,
    ) -> Result<(Vec<RunEvent>, broadcast::Receiver<RunEvent>)> {
        let handle = self.handle(run_id).await?;
        Ok(handle.tracker().subscribe_with_backlog().await)
    }

    /// Live events of every run.
    pub fn subscribe_all(&self) -> broadcast::Receiver<RunEvent> {
        self.event_bus.subscribe()
    }

    /// All known runs, newest first.
    pub async fn list(&self) -> Vec<RunSummary> {
        let handles: Vec<RunHandle> = self.runs.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            summaries.push(RunSummary::from(&handle.snapshot().await));
        }
        summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        summaries
    }

    /// Drop a terminal run from the table. Running runs are left alone.
    pub async fn forget(&self, run_id: RunId) -> Result<bool> {
        let handle = self.handle(run_id).await?;
        if !handle.tracker().status().await.is_terminal() {
            return Ok(false);
        }
        self.runs.write().await.remove(&run_id);
        Ok(true)
    }

    /// Drop every terminal run; returns how many were removed.
    pub async fn purge_finished(&self) -> usize {
        let handles: Vec<RunHandle> = self.runs.read().await.values().cloned().collect();
        let mut finished = Vec::new();
        for handle in handles {
            if handle.tracker().status().await.is_terminal() {
                finished.push(handle.id());
            }
        }
        let mut runs = self.runs.write().await;
        for run_id in &finished {
            runs.remove(run_id);
        }
        finished.len()
    }
}
