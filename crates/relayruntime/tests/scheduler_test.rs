use async_trait::async_trait;
use relaycore::{
    validate, ErrorKind, EventKind, ExecutionError, Graph, NodeConfig, NodeSpec, NodeStatus,
    RunStatus, StepContext, StepExecutor, StepOutput,
};
use relayruntime::{CancelOutcome, IntegrationRegistry, RelayRuntime, RuntimeConfig, RuntimeError, Scheduler};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test executors
// ============================================================================

struct Passthrough;

#[async_trait]
impl StepExecutor for Passthrough {
    fn node_type(&self) -> &str {
        "trigger"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, ExecutionError> {
        Ok(StepOutput::value(ctx.input.to_value()))
    }
}

/// Wraps its input together with its own id.
struct Echo;

#[async_trait]
impl StepExecutor for Echo {
    fn node_type(&self) -> &str {
        "echo"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, ExecutionError> {
        ctx.events.info(format!("echo from {}", ctx.node_id)).await;
        Ok(StepOutput::value(json!({
            "from": ctx.node_id,
            "input": ctx.input.to_value(),
        })))
    }
}

/// Sleeps for `ms`; honours cancellation unless `stubborn` is set.
struct Sleep {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Sleep {
    fn new() -> Self {
        Self {
            current: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl StepExecutor for Sleep {
    fn node_type(&self) -> &str {
        "sleep"
    }

    fn required_config(&self) -> &[&'static str] {
        &["ms"]
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, ExecutionError> {
        let NodeConfig::Integration(cfg) = &ctx.config else {
            return Err(ExecutionError::validation("expected integration config"));
        };
        let ms = cfg.params.get("ms").and_then(Value::as_u64).unwrap_or(0);
        let stubborn = cfg.params.get("stubborn").and_then(Value::as_bool).unwrap_or(false);

        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let result = if stubborn {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(StepOutput::value(json!({"slept_ms": ms})))
        } else {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(StepOutput::value(json!({"slept_ms": ms}))),
                _ = ctx.cancellation.cancelled() => Err(ExecutionError::cancelled()),
            }
        };

        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

struct Fail;

#[async_trait]
impl StepExecutor for Fail {
    fn node_type(&self) -> &str {
        "fail"
    }

    async fn execute(&self, _ctx: StepContext) -> Result<StepOutput, ExecutionError> {
        Err(ExecutionError::upstream("remote said no"))
    }
}

struct Invalid;

#[async_trait]
impl StepExecutor for Invalid {
    fn node_type(&self) -> &str {
        "invalid"
    }

    async fn execute(&self, _ctx: StepContext) -> Result<StepOutput, ExecutionError> {
        Err(ExecutionError::validation("bad input"))
    }
}

/// Fails until its attempt counter reaches `succeed_on`.
struct Flaky {
    calls: AtomicU32,
    succeed_on: u32,
}

#[async_trait]
impl StepExecutor for Flaky {
    fn node_type(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if ctx.attempt < self.succeed_on {
            Err(ExecutionError::upstream(format!("attempt {} rejected", ctx.attempt)))
        } else {
            Ok(StepOutput::value(json!({"attempt": ctx.attempt})))
        }
    }
}

/// Waits, then rejects every attempt.
struct SlowReject;

#[async_trait]
impl StepExecutor for SlowReject {
    fn node_type(&self) -> &str {
        "slow_reject"
    }

    async fn execute(&self, _ctx: StepContext) -> Result<StepOutput, ExecutionError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Err(ExecutionError::upstream("rejected"))
    }
}

struct Panics;

#[async_trait]
impl StepExecutor for Panics {
    fn node_type(&self) -> &str {
        "panics"
    }

    async fn execute(&self, _ctx: StepContext) -> Result<StepOutput, ExecutionError> {
        panic!("executor bug");
    }
}

/// Selects "true" when the configured field is truthy.
struct Branch;

#[async_trait]
impl StepExecutor for Branch {
    fn node_type(&self) -> &str {
        "conditional"
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutput, ExecutionError> {
        let NodeConfig::Conditional(condition) = &ctx.config else {
            return Err(ExecutionError::validation("expected conditional config"));
        };
        let truthy = matches!(ctx.input.lookup(&condition.field), Some(Value::Bool(true)));
        Ok(StepOutput::branch(if truthy { "true" } else { "false" }))
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn registry_with(sleep: Arc<Sleep>, flaky_succeeds_on: u32) -> IntegrationRegistry {
    let mut registry = IntegrationRegistry::new();
    registry.register(Arc::new(Passthrough));
    registry.register(Arc::new(Echo));
    registry.register(sleep);
    registry.register(Arc::new(Fail));
    registry.register(Arc::new(Invalid));
    registry.register(Arc::new(Flaky {
        calls: AtomicU32::new(0),
        succeed_on: flaky_succeeds_on,
    }));
    registry.register(Arc::new(Panics));
    registry.register(Arc::new(Branch));
    registry
}

fn runtime_with(config: RuntimeConfig) -> RelayRuntime {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    RelayRuntime::new(Arc::new(registry_with(Arc::new(Sleep::new()), 3)), config)
}

fn runtime() -> RelayRuntime {
    runtime_with(RuntimeConfig::default())
}

fn sleep_node(id: &str, ms: u64) -> NodeSpec {
    NodeSpec::new(id, "sleep").with_config("ms", ms)
}

fn linear(ids: &[(&str, NodeSpec)]) -> Graph {
    let mut graph = Graph::new("linear", "Linear");
    let mut previous: Option<&str> = None;
    for (id, spec) in ids {
        graph.add_node(spec.clone());
        if let Some(prev) = previous {
            graph.connect(prev, *id);
        }
        previous = Some(*id);
    }
    graph
}

async fn wait(runtime: &RelayRuntime, graph: &Graph, input: Value) -> relaycore::RunView {
    let handle = runtime.submit(graph, input).await.expect("graph should be valid");
    tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("run should terminate")
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test]
async fn test_linear_run_passes_outputs_downstream() {
    let runtime = runtime();
    let graph = linear(&[
        ("t", NodeSpec::new("t", "trigger")),
        ("a", NodeSpec::new("a", "echo")),
        ("b", NodeSpec::new("b", "echo")),
    ]);

    let view = wait(&runtime, &graph, json!({"user": "ada"})).await;

    assert_eq!(view.status, RunStatus::Succeeded);
    assert_eq!(view.count(NodeStatus::Succeeded), 3);
    let b = view.node("b").unwrap().output.clone().unwrap();
    assert_eq!(b["input"]["a"]["from"], json!("a"));
    assert_eq!(b["input"]["a"]["input"]["t"], json!({"user": "ada"}));
    assert!(view.finished_at.is_some());
}

#[tokio::test]
async fn test_timeout_fails_node_and_run() {
    let runtime = runtime();
    let graph = linear(&[
        ("t", NodeSpec::new("t", "trigger")),
        ("l", NodeSpec::new("l", "echo")),
        ("h", sleep_node("h", 2_000).with_timeout_ms(50)),
    ]);

    let view = wait(&runtime, &graph, json!({})).await;

    assert_eq!(view.status, RunStatus::Failed);
    assert!(view.error.is_none(), "node failures are not engine errors");
    assert_eq!(view.node_status("t"), Some(NodeStatus::Succeeded));
    assert_eq!(view.node_status("l"), Some(NodeStatus::Succeeded));
    let h = view.node("h").unwrap();
    assert_eq!(h.status, NodeStatus::Failed);
    assert_eq!(h.error.as_ref().unwrap().kind, ErrorKind::Timeout);
}

#[tokio::test]
async fn test_conditional_false_branch_skips_true_side() {
    let runtime = runtime();
    let mut graph = Graph::new("branchy", "Branchy");
    graph.add_node(NodeSpec::new("t", "trigger"));
    graph.add_node(
        NodeSpec::new("c", "conditional")
            .with_config("field", "flag")
            .with_config("operator", "truthy"),
    );
    graph.add_node(NodeSpec::new("s1", "echo"));
    graph.add_node(NodeSpec::new("s1_next", "echo"));
    graph.add_node(NodeSpec::new("s2", "echo"));
    graph.connect("t", "c");
    graph.connect_branch("c", "true", "s1");
    graph.connect("s1", "s1_next");
    graph.connect_branch("c", "false", "s2");

    let view = wait(&runtime, &graph, json!({"flag": false})).await;

    assert_eq!(view.status, RunStatus::Succeeded);
    assert_eq!(view.node("c").unwrap().branch.as_deref(), Some("false"));
    assert_eq!(view.node_status("s1"), Some(NodeStatus::Skipped));
    assert_eq!(view.node_status("s1_next"), Some(NodeStatus::Skipped));
    assert_eq!(view.node_status("s2"), Some(NodeStatus::Succeeded));
}

#[tokio::test]
async fn test_conditional_true_branch_skips_false_side() {
    let runtime = runtime();
    let mut graph = Graph::new("branchy", "Branchy");
    graph.add_node(NodeSpec::new("t", "trigger"));
    graph.add_node(
        NodeSpec::new("c", "conditional")
            .with_config("field", "flag")
            .with_config("operator", "truthy"),
    );
    graph.add_node(NodeSpec::new("yes", "echo"));
    graph.add_node(NodeSpec::new("no", "echo"));
    graph.connect("t", "c");
    graph.connect_branch("c", "true", "yes");
    graph.connect_branch("c", "false", "no");

    let view = wait(&runtime, &graph, json!({"flag": true})).await;

    assert_eq!(view.status, RunStatus::Succeeded);
    assert_eq!(view.node_status("yes"), Some(NodeStatus::Succeeded));
    assert_eq!(view.node_status("no"), Some(NodeStatus::Skipped));
}

#[tokio::test]
async fn test_failure_skips_descendants_only() {
    let runtime = runtime();
    let mut graph = Graph::new("g", "Failure");
    graph.add_node(NodeSpec::new("t", "trigger"));
    graph.add_node(NodeSpec::new("f", "fail"));
    graph.add_node(NodeSpec::new("a", "echo"));
    graph.add_node(NodeSpec::new("b", "echo"));
    graph.add_node(NodeSpec::new("x", "echo"));
    graph.connect("t", "f");
    graph.connect("f", "a");
    graph.connect("a", "b");
    graph.connect("t", "x");

    let view = wait(&runtime, &graph, json!({})).await;

    assert_eq!(view.status, RunStatus::Failed);
    let f = view.node("f").unwrap();
    assert_eq!(f.error.as_ref().unwrap().kind, ErrorKind::UpstreamRejection);
    assert_eq!(view.node_status("a"), Some(NodeStatus::Skipped));
    assert_eq!(view.node_status("b"), Some(NodeStatus::Skipped));
    assert_eq!(view.node_status("x"), Some(NodeStatus::Succeeded));
    assert!(view.node("a").unwrap().skip_reason.as_ref().unwrap().contains("'f'"));
}

#[tokio::test]
async fn test_join_waits_for_every_source() {
    let runtime = runtime();
    let mut graph = Graph::new("join", "Join");
    graph.add_node(NodeSpec::new("t", "trigger"));
    graph.add_node(NodeSpec::new("fast", "echo"));
    graph.add_node(sleep_node("slow", 50));
    graph.add_node(NodeSpec::new("j", "echo"));
    graph.connect("t", "fast");
    graph.connect("t", "slow");
    graph.connect("fast", "j");
    graph.connect("slow", "j");

    let view = wait(&runtime, &graph, json!({})).await;

    assert_eq!(view.status, RunStatus::Succeeded);
    let joined = view.node("j").unwrap().output.clone().unwrap();
    assert_eq!(joined["input"]["slow"], json!({"slept_ms": 50}));
    assert_eq!(joined["input"]["fast"]["from"], json!("fast"));
    let j_started = view.node("j").unwrap().started_at.unwrap();
    let slow_finished = view.node("slow").unwrap().finished_at.unwrap();
    assert!(j_started >= slow_finished);
}

#[tokio::test]
async fn test_join_after_failed_source_is_skipped() {
    let runtime = runtime();
    let mut graph = Graph::new("join", "Join");
    graph.add_node(NodeSpec::new("t", "trigger"));
    graph.add_node(NodeSpec::new("ok", "echo"));
    graph.add_node(NodeSpec::new("bad", "fail"));
    graph.add_node(NodeSpec::new("j", "echo"));
    graph.connect("t", "ok");
    graph.connect("t", "bad");
    graph.connect("ok", "j");
    graph.connect("bad", "j");

    let view = wait(&runtime, &graph, json!({})).await;

    assert_eq!(view.status, RunStatus::Failed);
    assert_eq!(view.node_status("ok"), Some(NodeStatus::Succeeded));
    assert_eq!(view.node_status("j"), Some(NodeStatus::Skipped));
}

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    let sleep = Arc::new(Sleep::new());
    let peak = sleep.peak.clone();
    let registry = Arc::new(registry_with(sleep, 1));
    let config = RuntimeConfig {
        max_concurrent_steps: 2,
        ..RuntimeConfig::default()
    };
    let runtime = RelayRuntime::new(registry, config);

    let mut graph = Graph::new("fan", "Fan out");
    graph.add_node(NodeSpec::new("t", "trigger"));
    for i in 0..6 {
        let id = format!("s{}", i);
        graph.add_node(sleep_node(&id, 30));
        graph.connect("t", id);
    }

    let view = wait(&runtime, &graph, json!({})).await;

    assert_eq!(view.status, RunStatus::Succeeded);
    assert_eq!(view.count(NodeStatus::Succeeded), 7);
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_parallel_roots_without_trigger() {
    let runtime = runtime();
    let mut graph = Graph::new("roots", "Roots");
    graph.add_node(sleep_node("a", 10));
    graph.add_node(sleep_node("b", 10));
    graph.add_node(NodeSpec::new("c", "echo"));
    graph.connect("a", "c");
    graph.connect("b", "c");

    let view = wait(&runtime, &graph, json!({"seed": 1})).await;

    assert_eq!(view.status, RunStatus::Succeeded);
    assert_eq!(view.count(NodeStatus::Succeeded), 3);
}

// ============================================================================
// Retries and failures
// ============================================================================

#[tokio::test]
async fn test_retry_until_success() {
    let runtime = runtime();
    let graph = linear(&[
        ("t", NodeSpec::new("t", "trigger")),
        ("f", NodeSpec::new("f", "flaky").with_retry(3, 5)),
    ]);
    let handle = runtime.submit(&graph, json!({})).await.unwrap();
    let view = handle.wait().await;

    assert_eq!(view.status, RunStatus::Succeeded);
    let f = view.node("f").unwrap();
    assert_eq!(f.attempts, 3);
    assert_eq!(f.output, Some(json!({"attempt": 3})));

    let events = runtime.events(handle.id(), 0).await.unwrap();
    let retries = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::NodeRetrying { .. }))
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_retry_exhaustion_fails_node() {
    let runtime = runtime();
    let graph = linear(&[
        ("t", NodeSpec::new("t", "trigger")),
        ("f", NodeSpec::new("f", "flaky").with_retry(2, 5)),
    ]);

    let view = wait(&runtime, &graph, json!({})).await;

    assert_eq!(view.status, RunStatus::Failed);
    let f = view.node("f").unwrap();
    assert_eq!(f.attempts, 2);
    assert_eq!(f.error.as_ref().unwrap().message, "attempt 2 rejected");
}

#[tokio::test]
async fn test_validation_errors_are_not_retried() {
    let runtime = runtime();
    let graph = linear(&[
        ("t", NodeSpec::new("t", "trigger")),
        ("v", NodeSpec::new("v", "invalid").with_retry(5, 5)),
    ]);

    let view = wait(&runtime, &graph, json!({})).await;

    let v = view.node("v").unwrap();
    assert_eq!(v.status, NodeStatus::Failed);
    assert_eq!(v.attempts, 1);
    assert_eq!(v.error.as_ref().unwrap().kind, ErrorKind::Validation);
}

#[tokio::test]
async fn test_panicking_step_is_an_internal_failure() {
    let runtime = runtime();
    let graph = linear(&[
        ("t", NodeSpec::new("t", "trigger")),
        ("p", NodeSpec::new("p", "panics")),
        ("after", NodeSpec::new("after", "echo")),
    ]);

    let view = wait(&runtime, &graph, json!({})).await;

    assert_eq!(view.status, RunStatus::Failed);
    let p = view.node("p").unwrap();
    assert_eq!(p.error.as_ref().unwrap().kind, ErrorKind::Internal);
    assert_eq!(view.node_status("after"), Some(NodeStatus::Skipped));
}

#[tokio::test]
async fn test_missing_executor_is_an_engine_error() {
    // Validated against a catalog that knows `echo`, executed by a registry that does not.
    let full = registry_with(Arc::new(Sleep::new()), 1);
    let mut graph = Graph::new("g", "Engine fault");
    graph.add_node(NodeSpec::new("t", "trigger"));
    graph.add_node(NodeSpec::new("e", "echo"));
    graph.add_node(NodeSpec::new("e2", "echo"));
    graph.connect("t", "e");
    graph.connect("e", "e2");
    let valid = Arc::new(validate(&graph, &full).unwrap());

    let mut partial = IntegrationRegistry::new();
    partial.register(Arc::new(Passthrough));
    let scheduler = Scheduler::new(Arc::new(partial), RuntimeConfig::default());

    let view = scheduler.run(valid, json!({})).wait().await;

    assert_eq!(view.status, RunStatus::Failed);
    assert!(view.error.as_ref().unwrap().contains("echo"));
    assert_eq!(view.node_status("t"), Some(NodeStatus::Succeeded));
    assert_eq!(view.node_status("e"), Some(NodeStatus::Skipped));
    assert_eq!(view.node_status("e2"), Some(NodeStatus::Skipped));
}

#[tokio::test]
async fn test_engine_error_fails_run_without_waiting_for_in_flight_steps() {
    let full = registry_with(Arc::new(Sleep::new()), 1);
    let mut graph = Graph::new("g", "Fault while busy");
    graph.add_node(NodeSpec::new("t", "trigger"));
    graph.add_node(sleep_node("s", 3_000).with_config("stubborn", true));
    graph.add_node(NodeSpec::new("e", "echo"));
    graph.connect("t", "s");
    graph.connect("t", "e");
    let valid = Arc::new(validate(&graph, &full).unwrap());

    let mut partial = IntegrationRegistry::new();
    partial.register(Arc::new(Passthrough));
    partial.register(Arc::new(Sleep::new()));
    let scheduler = Scheduler::new(Arc::new(partial), RuntimeConfig::default());

    let handle = scheduler.run(valid, json!({}));
    let view = tokio::time::timeout(Duration::from_millis(1_000), handle.wait())
        .await
        .expect("engine fault should end the run before the stubborn step stops");

    assert_eq!(view.status, RunStatus::Failed);
    assert!(view.error.as_ref().unwrap().contains("echo"));
    assert_eq!(view.node_status("e"), Some(NodeStatus::Skipped));
    let s = view.node("s").unwrap();
    assert_eq!(s.status, NodeStatus::Failed);
    assert_eq!(s.error.as_ref().unwrap().kind, ErrorKind::Cancelled);

    // The run stays frozen once the stubborn step finally returns.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.snapshot().await, view);
}

#[tokio::test]
async fn test_retry_bookkeeping_fault_fails_the_run() {
    let mut registry = IntegrationRegistry::new();
    registry.register(Arc::new(Passthrough));
    registry.register(Arc::new(SlowReject));
    let registry = Arc::new(registry);

    let mut graph = Graph::new("g", "Retry fault");
    graph.add_node(NodeSpec::new("t", "trigger"));
    graph.add_node(NodeSpec::new("r", "slow_reject").with_retry(3, 10));
    graph.connect("t", "r");
    let valid = Arc::new(validate(&graph, registry.as_ref()).unwrap());

    let handle = Scheduler::new(registry, RuntimeConfig::default()).run(valid, json!({}));
    while handle.tracker().node_status("r").await != Some(NodeStatus::Running) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // Moving the node out of `running` behind the scheduler's back makes the
    // retry bookkeeping illegal.
    handle
        .tracker()
        .mark_failed("r", ExecutionError::internal("closed elsewhere"))
        .await
        .unwrap();

    let view = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("run should terminate");
    assert_eq!(view.status, RunStatus::Failed);
    let error = view.error.expect("engine error should be recorded on the run");
    assert!(error.contains("Illegal transition"), "{}", error);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_is_idempotent_and_skips_pending() {
    let runtime = runtime();
    let graph = linear(&[
        ("t", NodeSpec::new("t", "trigger")),
        ("s", sleep_node("s", 5_000)),
        ("n", NodeSpec::new("n", "echo")),
    ]);
    let handle = runtime.submit(&graph, json!({})).await.unwrap();

    // Let the sleeper start.
    while handle.tracker().node_status("s").await != Some(NodeStatus::Running) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(runtime.cancel(handle.id()).await.unwrap(), CancelOutcome::Requested);
    assert_eq!(runtime.cancel(handle.id()).await.unwrap(), CancelOutcome::AlreadyRequested);

    let view = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .unwrap();
    assert_eq!(view.status, RunStatus::Cancelled);
    assert_eq!(view.node_status("t"), Some(NodeStatus::Succeeded));
    let s = view.node("s").unwrap();
    assert_eq!(s.status, NodeStatus::Failed);
    assert_eq!(s.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(view.node_status("n"), Some(NodeStatus::Skipped));

    assert_eq!(runtime.cancel(handle.id()).await.unwrap(), CancelOutcome::AlreadyFinished);
}

#[tokio::test]
async fn test_cancel_after_finish_changes_nothing() {
    let runtime = runtime();
    let graph = linear(&[
        ("t", NodeSpec::new("t", "trigger")),
        ("f", NodeSpec::new("f", "fail")),
    ]);
    let handle = runtime.submit(&graph, json!({})).await.unwrap();
    let before = handle.wait().await;
    let events_before = runtime.events(handle.id(), 0).await.unwrap().len();

    for _ in 0..3 {
        assert_eq!(handle.cancel().await, CancelOutcome::AlreadyFinished);
    }

    let after = runtime.status(handle.id()).await.unwrap();
    assert_eq!(after.status, RunStatus::Failed);
    assert_eq!(after.nodes, before.nodes);
    assert_eq!(runtime.events(handle.id(), 0).await.unwrap().len(), events_before);
}

#[tokio::test]
async fn test_stubborn_step_is_aborted_after_grace() {
    let config = RuntimeConfig {
        cancel_grace_ms: 50,
        ..RuntimeConfig::default()
    };
    let runtime = runtime_with(config);
    let graph = linear(&[
        ("t", NodeSpec::new("t", "trigger")),
        ("s", sleep_node("s", 60_000).with_config("stubborn", true)),
    ]);
    let handle = runtime.submit(&graph, json!({})).await.unwrap();
    while handle.tracker().node_status("s").await != Some(NodeStatus::Running) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    handle.cancel().await;
    let view = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("aborted step should not hold the run open");

    assert_eq!(view.status, RunStatus::Cancelled);
    let s = view.node("s").unwrap();
    assert_eq!(s.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
}

// ============================================================================
// Runtime surface
// ============================================================================

#[tokio::test]
async fn test_invalid_graph_creates_no_run() {
    let runtime = runtime();
    let mut graph = Graph::new("bad", "Bad");
    graph.add_node(NodeSpec::new("t", "trigger"));
    graph.connect("t", "ghost");

    let err = runtime.submit(&graph, json!({})).await.err().unwrap();
    match err {
        RuntimeError::Validation(errors) => {
            assert!(errors.to_string().contains("ghost"));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(runtime.list().await.is_empty());
}

#[tokio::test]
async fn test_event_log_is_ordered_and_ends_with_run_finished() {
    let runtime = runtime();
    let graph = linear(&[
        ("t", NodeSpec::new("t", "trigger")),
        ("a", NodeSpec::new("a", "echo")),
    ]);
    let handle = runtime.submit(&graph, json!({})).await.unwrap();
    handle.wait().await;

    let events = runtime.events(handle.id(), 0).await.unwrap();
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq, i as u64);
        assert_eq!(event.run_id, handle.id());
    }
    assert!(matches!(events.first().unwrap().kind, EventKind::RunStarted { node_count: 2, .. }));
    assert!(matches!(
        events.last().unwrap().kind,
        EventKind::RunFinished { status: RunStatus::Succeeded, .. }
    ));
    assert!(events
        .iter()
        .any(|e| matches!(&e.kind, EventKind::NodeMessage { node_id, .. } if node_id == "a")));

    let tail = runtime.events(handle.id(), 2).await.unwrap();
    assert_eq!(tail.first().unwrap().seq, 2);
    assert_eq!(tail.len(), events.len() - 2);
}

#[tokio::test]
async fn test_forget_and_purge() {
    let runtime = runtime();
    let graph = linear(&[("t", NodeSpec::new("t", "trigger"))]);

    let first = runtime.submit(&graph, json!({})).await.unwrap();
    let second = runtime.submit(&graph, json!({})).await.unwrap();
    first.wait().await;
    second.wait().await;
    assert_eq!(runtime.list().await.len(), 2);

    assert!(runtime.forget(first.id()).await.unwrap());
    assert!(matches!(
        runtime.status(first.id()).await,
        Err(RuntimeError::RunNotFound(_))
    ));
    assert_eq!(runtime.purge_finished().await, 1);
    assert!(runtime.list().await.is_empty());
}

#[tokio::test]
async fn test_running_run_is_not_forgotten() {
    let runtime = runtime();
    let graph = linear(&[("s", sleep_node("s", 5_000))]);
    let handle = runtime.submit(&graph, json!({})).await.unwrap();

    assert!(!runtime.forget(handle.id()).await.unwrap());
    assert_eq!(runtime.purge_finished().await, 0);

    handle.cancel().await;
    handle.wait().await;
}

#[tokio::test]
async fn test_global_subscription_sees_every_run() {
    let runtime = runtime();
    let mut all = runtime.subscribe_all();
    let graph = linear(&[("t", NodeSpec::new("t", "trigger"))]);

    let handle = runtime.submit(&graph, json!({})).await.unwrap();
    handle.wait().await;

    let mut finished = false;
    while let Ok(event) = all.try_recv() {
        assert_eq!(event.run_id, handle.id());
        if matches!(event.kind, EventKind::RunFinished { .. }) {
            finished = true;
        }
    }
    assert!(finished);
}
