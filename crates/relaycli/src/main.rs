use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use relaycore::{EventKind, Graph, NodeMessage, NodeSpec, NodeStatus, RunEvent, RunStatus};
use relaynodes::Settings;
use relayruntime::RelayRuntime;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Relay workflow engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a graph file
    Run {
        /// Path to graph JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Input data as JSON string
        #[arg(short, long)]
        input: Option<String>,

        /// JSON settings file with `runtime` and `nodes` sections
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Default per-step timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Maximum concurrently executing steps
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a graph file
    Validate {
        /// Path to graph JSON file
        file: PathBuf,
    },

    /// List available node types
    Nodes,

    /// Create a new example graph
    Init {
        /// Output file path
        #[arg(short, long, default_value = "graph.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            config,
            timeout_ms,
            max_concurrency,
            verbose,
        } => {
            let default_level = if verbose { "debug" } else { "warn" };
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new(default_level)),
                )
                .init();

            let mut settings = load_settings(config.as_deref())?;
            if let Some(ms) = timeout_ms {
                settings.runtime.default_step_timeout_ms = ms;
            }
            if let Some(n) = max_concurrency {
                settings.runtime.max_concurrent_steps = n;
            }
            let status = run_graph(&file, input, settings).await?;
            if status != RunStatus::Succeeded {
                bail!("run finished with status {}", status);
            }
        }

        Commands::Validate { file } => {
            validate_graph(&file)?;
        }

        Commands::Nodes => {
            list_nodes();
        }

        Commands::Init { output } => {
            create_example_graph(&output)?;
        }
    }

    Ok(())
}

fn load_graph(file: &Path) -> Result<Graph> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading graph file {}", file.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing graph file {}", file.display()))
}

fn load_settings(file: Option<&Path>) -> Result<Settings> {
    let Some(file) = file else {
        return Ok(Settings::default());
    };
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading settings file {}", file.display()))?;
    Settings::from_json(&text).with_context(|| format!("parsing settings file {}", file.display()))
}

fn parse_input(input: Option<String>) -> Result<Value> {
    match input {
        Some(text) => serde_json::from_str(&text).context("input must be valid JSON"),
        None => Ok(json!({})),
    }
}

/// One console line per event worth showing.
fn describe(event: &RunEvent) -> Option<String> {
    match &event.kind {
        EventKind::RunStarted { node_count, .. } => {
            Some(format!("▶️  Run started ({} nodes)", node_count))
        }
        EventKind::NodeStatusChanged {
            node_id,
            status,
            error,
            branch,
        } => match status {
            NodeStatus::Running => Some(format!("  ⚡ Starting node: {}", node_id)),
            NodeStatus::Succeeded => Some(match branch {
                Some(branch) => format!("  ✅ Node {} took branch '{}'", node_id, branch),
                None => format!("  ✅ Node {} completed", node_id),
            }),
            NodeStatus::Failed => Some(format!(
                "  ❌ Node {} failed: {}",
                node_id,
                error
                    .as_ref()
                    .map(|e| format!("{}: {}", e.kind, e.message))
                    .unwrap_or_default()
            )),
            NodeStatus::Skipped => Some(format!("  ⏭️  Node {} skipped", node_id)),
            NodeStatus::Idle => None,
        },
        EventKind::NodeRetrying {
            node_id,
            attempt,
            delay_ms,
            error,
        } => Some(format!(
            "  🔁 Node {} attempt {} failed ({}); retrying in {}ms",
            node_id, attempt, error.message, delay_ms
        )),
        EventKind::NodeMessage { node_id, message } => Some(match message {
            NodeMessage::Info { message } => format!("     ℹ️  [{}] {}", node_id, message),
            NodeMessage::Warning { message } => format!("     ⚠️  [{}] {}", node_id, message),
            NodeMessage::Progress { percent, message } => match message {
                Some(msg) => format!("     📊 [{}] {}% - {}", node_id, percent, msg),
                None => format!("     📊 [{}] {}%", node_id, percent),
            },
        }),
        EventKind::RunFinished {
            status,
            duration_ms,
        } => Some(match status {
            RunStatus::Succeeded => format!("✨ Run completed successfully in {}ms", duration_ms),
            other => format!("💥 Run {} after {}ms", other, duration_ms),
        }),
    }
}

async fn run_graph(file: &Path, input: Option<String>, settings: Settings) -> Result<RunStatus> {
    println!("🚀 Loading graph from: {}", file.display());

    let graph = load_graph(file)?;
    let input = parse_input(input)?;

    println!("📋 Graph: {}", graph.name);
    println!("   Nodes: {}", graph.nodes.len());
    println!("   Edges: {}", graph.edges.len());
    println!();

    let registry = relaynodes::standard_registry(&settings.nodes);
    let runtime = RelayRuntime::new(Arc::new(registry), settings.runtime);

    let handle = match runtime.submit(&graph, input).await {
        Ok(handle) => handle,
        Err(relayruntime::RuntimeError::Validation(errors)) => {
            for err in errors.iter() {
                println!("  ❌ {}", err);
            }
            bail!("graph is invalid ({} errors)", errors.len());
        }
        Err(e) => return Err(e.into()),
    };

    debug!(run_id = %handle.id(), "run submitted");
    let (backlog, mut events) = runtime.subscribe(handle.id()).await?;
    let mut finished = false;
    for event in &backlog {
        finished |= matches!(event.kind, EventKind::RunFinished { .. });
        if let Some(line) = describe(event) {
            println!("{}", line);
        }
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    while !finished {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    finished = matches!(event.kind, EventKind::RunFinished { .. });
                    if let Some(line) = describe(&event) {
                        println!("{}", line);
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                println!("🛑 Cancelling run...");
                handle.cancel().await;
            }
        }
    }

    let view = handle.wait().await;

    println!();
    println!("📊 Run Summary:");
    println!("   Run ID: {}", view.run_id);
    println!("   Status: {}", view.status);
    println!(
        "   Succeeded: {}/{} nodes ({} failed, {} skipped)",
        view.count(NodeStatus::Succeeded),
        view.nodes.len(),
        view.count(NodeStatus::Failed),
        view.count(NodeStatus::Skipped)
    );
    if let Some(error) = &view.error {
        println!("   Engine error: {}", error);
    }

    let outputs: Vec<_> = view
        .nodes
        .iter()
        .filter_map(|(id, result)| result.output.as_ref().map(|o| (id, result, o)))
        .collect();
    if !outputs.is_empty() {
        println!();
        println!("📤 Outputs:");
        for (node_id, result, output) in outputs {
            match result.duration_ms() {
                Some(ms) => println!("   {} ({}ms): {}", node_id, ms, output),
                None => println!("   {}: {}", node_id, output),
            }
        }
    }

    Ok(view.status)
}

fn validate_graph(file: &Path) -> Result<()> {
    println!("🔍 Validating graph: {}", file.display());

    let graph = load_graph(file)?;
    let registry = relaynodes::standard_registry(&Default::default());
    match relaycore::validate(&graph, &registry) {
        Ok(valid) => {
            println!("✅ Graph is valid:");
            println!("   Name: {}", graph.name);
            println!("   Nodes: {}", valid.len());
            println!("   Edges: {}", valid.edges().len());
            println!("   Roots: {}", valid.roots().join(", "));
            Ok(())
        }
        Err(errors) => {
            for err in errors.iter() {
                println!("  ❌ {}", err);
            }
            bail!("graph is invalid ({} errors)", errors.len())
        }
    }
}

fn list_nodes() {
    println!("📦 Available Node Types:");
    println!();

    let registry = relaynodes::standard_registry(&Default::default());

    for node_type in registry.list_node_types() {
        if let Some(metadata) = registry.get_metadata(&node_type) {
            println!("  • {} ({})", node_type, metadata.category);
            println!("    {}", metadata.description);
        } else {
            println!("  • {}", node_type);
        }
        if let Some(keys) = registry.required_config(&node_type).filter(|k| !k.is_empty()) {
            println!("    requires: {}", keys.join(", "));
        }
    }
}

fn example_graph() -> Graph {
    let mut graph = Graph::new("example", "Example HTTP Graph")
        .with_description("Fetches a URL and reports whether the call succeeded");

    graph.add_node(NodeSpec::new("start", "trigger").with_label("Start"));
    graph.add_node(
        NodeSpec::new("fetch", "http_call")
            .with_label("Fetch Data")
            .with_config("method", "GET")
            .with_config("url", "{{ url }}")
            .with_timeout_ms(10_000)
            .with_retry(3, 500),
    );
    graph.add_node(
        NodeSpec::new("check", "conditional")
            .with_label("Status OK?")
            .with_config("field", "status")
            .with_config("operator", "equals")
            .with_config("value", 200),
    );
    graph.add_node(
        NodeSpec::new("ok", "data_transform")
            .with_label("Report")
            .with_config("operation", "template")
            .with_config("template", "Fetched {{ fetch.body }}"),
    );
    graph.add_node(
        NodeSpec::new("unexpected", "data_transform")
            .with_label("Report Unexpected")
            .with_config("operation", "set")
            .with_config("values", json!({"note": "unexpected status"})),
    );

    graph.connect("start", "fetch");
    graph.connect("fetch", "check");
    graph.connect_branch("check", "true", "ok");
    graph.connect_branch("check", "false", "unexpected");
    graph
}

fn create_example_graph(output: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&example_graph())?;
    std::fs::write(output, json).with_context(|| format!("writing {}", output.display()))?;

    println!("✨ Created example graph: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  relay run --file {} --input '{{\"url\": \"https://api.github.com/zen\"}}'",
        output.display()
    );

    Ok(())
}
