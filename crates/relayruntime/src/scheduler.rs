//! Scheduler: decides what may run when and drives one run to completion.

use crate::config::RuntimeConfig;
use crate::registry::IntegrationRegistry;
use crate::tracker::RunTracker;
use futures::stream::{FuturesUnordered, StreamExt};
use relaycore::{
    EngineError, ErrorKind, EventEmitter, EventSink, ExecutionError, Node, NodeId, RunEvent, RunId,
    RunStatus, RunView, StepContext, StepExecutor, StepInput, StepOutput, ValidGraph,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinError};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Requested,
    AlreadyRequested,
    /// The run was terminal; nothing changed.
    AlreadyFinished,
}

/// Handle for observing and cancelling one run.
#[derive(Clone)]
pub struct RunHandle {
    run_id: RunId,
    tracker: Arc<RunTracker>,
    cancel: CancellationToken,
}

impl RunHandle {
    pub fn id(&self) -> RunId {
        self.run_id
    }

    pub fn tracker(&self) -> &Arc<RunTracker> {
        &self.tracker
    }

    pub async fn snapshot(&self) -> RunView {
        self.tracker.snapshot().await
    }

    pub async fn wait(&self) -> RunView {
        self.tracker.wait_terminal().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tracker.subscribe()
    }

    /// Request cooperative cancellation. Idempotent.
    pub async fn cancel(&self) -> CancelOutcome {
        if self.tracker.status().await.is_terminal() {
            return CancelOutcome::AlreadyFinished;
        }
        if self.cancel.is_cancelled() {
            return CancelOutcome::AlreadyRequested;
        }
        info!(run_id = %self.run_id, "cancellation requested");
        self.cancel.cancel();
        CancelOutcome::Requested
    }
}

/// Starts runs of validated graphs.
pub struct Scheduler {
    registry: Arc<IntegrationRegistry>,
    config: RuntimeConfig,
    bus: Option<broadcast::Sender<RunEvent>>,
}

impl Scheduler {
    pub fn new(registry: Arc<IntegrationRegistry>, config: RuntimeConfig) -> Self {
        Self {
            registry,
            config,
            bus: None,
        }
    }

    /// Also forward every run's events to a process-wide channel.
    pub fn with_event_bus(mut self, bus: broadcast::Sender<RunEvent>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Start a new run and return immediately.
    pub fn run(&self, graph: Arc<ValidGraph>, input: Value) -> RunHandle {
        let run_id = Uuid::new_v4();
        let tracker = Arc::new(RunTracker::new(
            run_id,
            &graph,
            self.config.event_buffer_size,
            self.bus.clone(),
        ));
        let cancel = CancellationToken::new();

        let driver = RunDriver {
            graph,
            registry: self.registry.clone(),
            config: self.config.clone(),
            tracker: tracker.clone(),
            cancel: cancel.clone(),
            input,
        };

        let task = tokio::spawn(driver.drive());
        let supervised = tracker.clone();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                error!(run_id = %run_id, "scheduler task died: {}", e);
                supervised
                    .finish(RunStatus::Failed, Some(format!("scheduler task died: {}", e)))
                    .await;
            }
        });

        RunHandle {
            run_id,
            tracker,
            cancel,
        }
    }
}

/// A step's own result, or an engine fault raised while it ran.
type StepOutcome = Result<Result<StepOutput, ExecutionError>, EngineError>;
type StepFuture = Pin<Box<dyn Future<Output = (NodeId, Result<StepOutcome, JoinError>)> + Send>>;

/// Bookkeeping for nodes that have not started yet.
struct Plan {
    /// Not dispatched and not skipped.
    pending: HashSet<NodeId>,
    /// Unsatisfied incoming edges per pending node.
    remaining: HashMap<NodeId, usize>,
    ready: VecDeque<NodeId>,
}

impl Plan {
    fn new(graph: &ValidGraph) -> Self {
        let mut pending = HashSet::new();
        let mut remaining = HashMap::new();
        for id in graph.topological_order() {
            pending.insert(id.clone());
            remaining.insert(id.clone(), graph.dependency_count(id));
        }
        let ready = graph.roots().iter().cloned().collect();
        Self {
            pending,
            remaining,
            ready,
        }
    }

    /// Marks one incoming edge of `target` satisfied; true when it becomes ready.
    fn satisfy(&mut self, target: &str) -> bool {
        if !self.pending.contains(target) {
            return false;
        }
        match self.remaining.get_mut(target) {
            Some(count) => {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.ready.push_back(target.to_string());
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    fn take(&mut self, node_id: &str) -> bool {
        self.pending.remove(node_id)
    }
}

struct RunDriver {
    graph: Arc<ValidGraph>,
    registry: Arc<IntegrationRegistry>,
    config: RuntimeConfig,
    tracker: Arc<RunTracker>,
    cancel: CancellationToken,
    input: Value,
}

impl RunDriver {
    #[instrument(
        name = "run",
        skip(self),
        fields(run_id = %self.tracker.run_id(), graph_id = %self.graph.id())
    )]
    async fn drive(self) -> RunStatus {
        info!(nodes = self.graph.len(), "run started");
        self.tracker.start().await;

        // Steps get a child token so an engine fault can stop them without
        // looking like an external cancellation.
        let steps = self.cancel.child_token();
        let mut plan = Plan::new(&self.graph);
        let mut outputs: HashMap<NodeId, Value> = HashMap::new();
        let mut running: FuturesUnordered<StepFuture> = FuturesUnordered::new();
        let mut aborts: HashMap<NodeId, AbortHandle> = HashMap::new();
        let mut any_failed = false;
        let mut cancelled = false;
        let mut fatal: Option<EngineError> = None;
        let mut grace_deadline: Option<Instant> = None;

        loop {
            if !cancelled && fatal.is_none() && self.cancel.is_cancelled() {
                cancelled = true;
                info!("run cancelled; skipping nodes that have not started");
                self.skip_all_pending(&mut plan, "run cancelled", &mut fatal).await;
                grace_deadline = Some(Instant::now() + self.config.cancel_grace());
            }

            if !cancelled && fatal.is_none() {
                if let Err(e) = self
                    .dispatch_ready(&mut plan, &outputs, &steps, &mut running, &mut aborts)
                    .await
                {
                    self.abort_on_fault(e, &mut plan, &aborts, &steps, &mut fatal).await;
                    grace_deadline = Some(Instant::now() + self.config.cancel_grace());
                }
            }

            if running.is_empty() {
                break;
            }

            let grace = async move {
                match grace_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled(), if !cancelled && fatal.is_none() => {
                    // Handled at the top of the loop.
                }
                _ = grace => {
                    warn!(in_flight = aborts.len(), "steps did not stop within grace period; aborting");
                    for handle in aborts.values() {
                        handle.abort();
                    }
                    grace_deadline = None;
                }
                Some((node_id, joined)) = running.next() => {
                    aborts.remove(&node_id);
                    if fatal.is_some() {
                        // The run is already failed and frozen; this step only had to stop.
                        debug!(node_id = %node_id, "step settled after engine error");
                    } else {
                        let outcome = match joined {
                            Ok(outcome) => outcome,
                            Err(e) if e.is_cancelled() => Ok(Err(ExecutionError::cancelled())),
                            Err(e) => Ok(Err(ExecutionError::internal(format!("step task panicked: {}", e)))),
                        };
                        let completion = match outcome {
                            Ok(result) => {
                                self.complete(&node_id, result, &mut plan, &mut outputs, cancelled)
                                    .await
                            }
                            Err(e) => Err(e),
                        };
                        match completion {
                            Ok(failed) => any_failed |= failed,
                            Err(e) => {
                                self.abort_on_fault(e, &mut plan, &aborts, &steps, &mut fatal).await;
                                grace_deadline = Some(Instant::now() + self.config.cancel_grace());
                            }
                        }
                    }
                }
            }
        }

        // Every node is terminal on natural completion; anything left is a scheduling bug.
        if !plan.pending.is_empty() {
            warn!(left = plan.pending.len(), "nodes left unscheduled");
            self.skip_all_pending(&mut plan, "unreachable", &mut fatal).await;
        }

        let (status, error) = match (&fatal, cancelled, any_failed) {
            (Some(e), _, _) => (RunStatus::Failed, Some(e.to_string())),
            (None, true, _) => (RunStatus::Cancelled, None),
            (None, false, true) => (RunStatus::Failed, None),
            (None, false, false) => (RunStatus::Succeeded, None),
        };
        self.tracker.finish(status, error).await;
        info!(status = %status, "run finished");
        status
    }

    async fn dispatch_ready(
        &self,
        plan: &mut Plan,
        outputs: &HashMap<NodeId, Value>,
        steps: &CancellationToken,
        running: &mut FuturesUnordered<StepFuture>,
        aborts: &mut HashMap<NodeId, AbortHandle>,
    ) -> Result<(), EngineError> {
        let limit = self.config.max_concurrent_steps.max(1);
        while running.len() < limit {
            let Some(node_id) = plan.ready.pop_front() else {
                break;
            };
            if !plan.pending.contains(&node_id) {
                continue;
            }

            let node = self
                .graph
                .node(&node_id)
                .ok_or_else(|| EngineError::NodeNotFound(node_id.clone()))?
                .clone();
            let executor = self.registry.get(node.kind.type_id()).ok_or_else(|| {
                EngineError::UnknownNodeType {
                    node_id: node_id.clone(),
                    node_type: node.kind.type_id().to_string(),
                }
            })?;

            plan.take(&node_id);
            let input = self.collect_input(&node_id, outputs);
            self.tracker.mark_running(&node_id).await?;
            debug!(node_id = %node_id, node_type = %node.kind, "dispatching step");

            let step = StepRun {
                run_id: self.tracker.run_id(),
                node,
                input,
                executor,
                tracker: self.tracker.clone(),
                cancel: steps.child_token(),
                default_timeout: self.config.default_step_timeout(),
            };
            let handle = tokio::spawn(step.execute());
            aborts.insert(node_id.clone(), handle.abort_handle());
            running.push(Box::pin(async move { (node_id, handle.await) }));
        }
        Ok(())
    }

    fn collect_input(&self, node_id: &str, outputs: &HashMap<NodeId, Value>) -> StepInput {
        if self.graph.dependency_count(node_id) == 0 {
            return StepInput::Initial(self.input.clone());
        }
        let upstream: BTreeMap<NodeId, Value> = self
            .graph
            .incoming(node_id)
            .filter_map(|edge| {
                outputs
                    .get(&edge.source)
                    .map(|v| (edge.source.clone(), v.clone()))
            })
            .collect();
        StepInput::Upstream(upstream)
    }

    /// Records a finished step and releases or skips its dependents.
    /// Returns whether the node failed.
    async fn complete(
        &self,
        node_id: &str,
        result: Result<StepOutput, ExecutionError>,
        plan: &mut Plan,
        outputs: &mut HashMap<NodeId, Value>,
        stopping: bool,
    ) -> Result<bool, EngineError> {
        let is_conditional = self
            .graph
            .node(node_id)
            .map(Node::is_conditional)
            .unwrap_or(false);

        let result = match result {
            Ok(output) if is_conditional && output.branch.is_none() => Err(ExecutionError::internal(
                "conditional node produced no branch selector",
            )),
            other => other,
        };

        match result {
            Ok(output) => {
                info!(node_id = %node_id, branch = ?output.branch, "node succeeded");
                let branch = output.branch.clone();
                outputs.insert(node_id.to_string(), output.value.clone());
                self.tracker.mark_succeeded(node_id, output).await?;
                if stopping {
                    return Ok(false);
                }

                let edges: Vec<_> = self.graph.outgoing(node_id).cloned().collect();
                for edge in edges {
                    if is_conditional && edge.branch != branch {
                        let reason = format!(
                            "branch '{}' of '{}' not selected",
                            edge.branch.as_deref().unwrap_or_default(),
                            node_id
                        );
                        self.skip_downstream(&edge.target, &reason, plan).await?;
                    } else {
                        plan.satisfy(&edge.target);
                    }
                }
                Ok(false)
            }
            Err(err) => {
                warn!(node_id = %node_id, kind = %err.kind, "node failed: {}", err.message);
                self.tracker.mark_failed(node_id, err).await?;
                if !stopping {
                    let reason = format!("upstream '{}' failed", node_id);
                    let targets: Vec<_> = self
                        .graph
                        .outgoing(node_id)
                        .map(|e| e.target.clone())
                        .collect();
                    for target in targets {
                        self.skip_downstream(&target, &reason, plan).await?;
                    }
                }
                Ok(true)
            }
        }
    }

    /// Skips `start` and, transitively, everything that depends on it and has not started.
    async fn skip_downstream(
        &self,
        start: &str,
        reason: &str,
        plan: &mut Plan,
    ) -> Result<(), EngineError> {
        let mut stack = vec![start.to_string()];
        while let Some(node_id) = stack.pop() {
            if !plan.take(&node_id) {
                continue;
            }
            debug!(node_id = %node_id, reason, "skipping node");
            self.tracker.mark_skipped(&node_id, reason).await?;
            stack.extend(self.graph.outgoing(&node_id).map(|e| e.target.clone()));
        }
        Ok(())
    }

    /// Fails the run as soon as an engine fault is seen.
    ///
    /// Pending nodes are skipped, in-flight nodes are recorded as cancelled and
    /// the run becomes terminal before the in-flight tasks have actually stopped.
    async fn abort_on_fault(
        &self,
        err: EngineError,
        plan: &mut Plan,
        in_flight: &HashMap<NodeId, AbortHandle>,
        steps: &CancellationToken,
        fatal: &mut Option<EngineError>,
    ) {
        error!("engine error, aborting run: {}", err);
        steps.cancel();
        let message = err.to_string();
        *fatal = Some(err);

        self.skip_all_pending(plan, "run aborted by engine error", fatal).await;

        let mut running: Vec<&NodeId> = in_flight.keys().collect();
        running.sort();
        for node_id in running {
            let stopped = ExecutionError::new(ErrorKind::Cancelled, "run aborted by engine error");
            if let Err(e) = self.tracker.mark_failed(node_id, stopped).await {
                error!(node_id = %node_id, "could not fail in-flight node: {}", e);
            }
        }

        self.tracker.finish(RunStatus::Failed, Some(message)).await;
    }

    async fn skip_all_pending(&self, plan: &mut Plan, reason: &str, fatal: &mut Option<EngineError>) {
        plan.ready.clear();
        let mut left: Vec<NodeId> = plan.pending.drain().collect();
        left.sort();
        for node_id in left {
            if let Err(e) = self.tracker.mark_skipped(&node_id, reason).await {
                error!(node_id = %node_id, "could not skip node: {}", e);
                fatal.get_or_insert(e);
            }
        }
    }
}

/// One node's invocation, including timeouts and retries.
struct StepRun {
    run_id: RunId,
    node: Node,
    input: StepInput,
    executor: Arc<dyn StepExecutor>,
    tracker: Arc<RunTracker>,
    cancel: CancellationToken,
    default_timeout: Duration,
}

impl StepRun {
    #[instrument(
        name = "step",
        skip(self),
        fields(run_id = %self.run_id, node_id = %self.node.id, node_type = %self.node.kind)
    )]
    async fn execute(self) -> StepOutcome {
        let deadline = self.node.timeout.unwrap_or(self.default_timeout);
        let max_attempts = self
            .node
            .retry
            .as_ref()
            .map(|r| r.max_attempts.max(1))
            .unwrap_or(1);
        let sink: Arc<dyn EventSink> = self.tracker.clone();
        let mut attempt = 1u32;

        loop {
            let ctx = StepContext {
                run_id: self.run_id,
                node_id: self.node.id.clone(),
                label: self.node.label.clone(),
                config: self.node.config.clone(),
                input: self.input.clone(),
                attempt,
                cancellation: self.cancel.clone(),
                events: EventEmitter::new(self.node.id.clone(), sink.clone()),
            };

            let result = match timeout(deadline, self.executor.execute(ctx)).await {
                Ok(result) => result,
                Err(_) => Err(ExecutionError::timeout(deadline.as_millis() as u64)),
            };

            let err = match result {
                Ok(output) => return Ok(Ok(output)),
                Err(err) => err,
            };

            let retry = self.node.retry.as_ref().filter(|_| {
                attempt < max_attempts && err.kind.is_retryable() && !self.cancel.is_cancelled()
            });
            let Some(policy) = retry else {
                return Ok(Err(err));
            };

            let delay = policy.delay_after(attempt);
            warn!(
                "attempt {}/{} failed: {}. Retrying in {}ms",
                attempt,
                max_attempts,
                err,
                delay.as_millis()
            );
            self.tracker
                .mark_retrying(&self.node.id, attempt, delay, &err)
                .await?;

            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.cancel.cancelled() => return Ok(Err(ExecutionError::cancelled())),
            }
            attempt += 1;
        }
    }
}
