mod routes;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use relaynodes::Settings;
use relayruntime::RelayRuntime;
use routes::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// HTTP and WebSocket server for the relay workflow engine
#[derive(Parser, Debug)]
#[command(name = "relayserver", version, about)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "RELAY_BIND", default_value = "0.0.0.0:3000")]
    bind: String,

    /// JSON settings file with `runtime` and `nodes` sections
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// API key for model_call nodes
    #[arg(long, env = "RELAY_MODEL_API_KEY", hide_env_values = true)]
    model_api_key: Option<String>,

    /// Override the model API base URL
    #[arg(long, env = "RELAY_MODEL_API_BASE")]
    model_api_base: Option<String>,

    /// Maximum concurrently executing steps per run
    #[arg(long, env = "RELAY_MAX_CONCURRENCY")]
    max_concurrency: Option<usize>,
}

impl Args {
    fn settings(&self) -> anyhow::Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                Settings::from_json(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => Settings::default(),
        };
        if let Some(key) = &self.model_api_key {
            settings.nodes.model_api_key = Some(key.clone());
        }
        if let Some(base) = &self.model_api_base {
            settings.nodes.model_api_base = base.clone();
        }
        if let Some(n) = self.max_concurrency {
            settings.runtime.max_concurrent_steps = n;
        }
        Ok(settings)
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = args.settings()?;

    info!("Starting relay server");

    let registry = relaynodes::standard_registry(&settings.nodes);
    if settings.nodes.model_api_key.is_none() {
        info!("No model API key configured; model_call nodes will fail");
    }
    let runtime = RelayRuntime::new(Arc::new(registry), settings.runtime.clone());

    info!(
        node_types = runtime.registry().len(),
        max_concurrent_steps = settings.runtime.max_concurrent_steps,
        "Runtime initialized with standard nodes"
    );

    let app_state = web::Data::new(AppState {
        runtime: Arc::new(runtime),
    });

    info!("Server starting on http://{}", args.bind);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .configure(routes::configure)
    })
    .bind(&args.bind)?
    .run()
    .await?;

    Ok(())
}
