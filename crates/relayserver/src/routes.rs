use actix_web::{delete, get, post, web, HttpRequest, HttpResponse, Responder};
use actix_ws::Message;
use relaycore::{EventKind, Graph};
use relayruntime::{RelayRuntime, RuntimeError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use uuid::Uuid;

/// Application state shared across handlers
pub struct AppState {
    pub runtime: Arc<RelayRuntime>,
}

/// Request body for starting a run
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub graph: Graph,
    #[serde(default)]
    pub input: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub since: u64,
}

/// Error response
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn runtime_error(err: RuntimeError) -> HttpResponse {
    match err {
        RuntimeError::RunNotFound(_) => HttpResponse::NotFound().json(ErrorResponse {
            error: err.to_string(),
        }),
        RuntimeError::Validation(errors) => HttpResponse::UnprocessableEntity().json(json!({
            "valid": false,
            "errors": errors,
            "messages": errors.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
        })),
    }
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "relay"
    }))
}

/// List available node types
#[get("/api/node-types")]
async fn list_node_types(data: web::Data<AppState>) -> impl Responder {
    let registry = data.runtime.registry();
    let nodes: Vec<_> = registry
        .list_node_types()
        .iter()
        .map(|node_type| {
            let metadata = registry.get_metadata(node_type).unwrap_or_default();
            json!({
                "type": node_type,
                "description": metadata.description,
                "category": metadata.category,
                "required_config": registry.required_config(node_type).unwrap_or(&[]),
            })
        })
        .collect();

    HttpResponse::Ok().json(nodes)
}

#[post("/api/graphs/validate")]
async fn validate_graph(data: web::Data<AppState>, graph: web::Json<Graph>) -> impl Responder {
    match data.runtime.validate(&graph) {
        Ok(valid) => HttpResponse::Ok().json(json!({
            "valid": true,
            "roots": valid.roots(),
            "order": valid.topological_order(),
        })),
        Err(e) => runtime_error(e),
    }
}

#[post("/api/runs")]
async fn submit_run(data: web::Data<AppState>, req: web::Json<SubmitRequest>) -> impl Responder {
    let SubmitRequest { graph, input } = req.into_inner();
    info!("Submitting graph: {} ({})", graph.name, graph.id);

    match data.runtime.submit(&graph, input).await {
        Ok(handle) => HttpResponse::Accepted().json(json!({ "run_id": handle.id() })),
        Err(e) => runtime_error(e),
    }
}

#[get("/api/runs")]
async fn list_runs(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(data.runtime.list().await)
}

#[get("/api/runs/{id}")]
async fn get_run(data: web::Data<AppState>, path: web::Path<Uuid>) -> impl Responder {
    match data.runtime.status(path.into_inner()).await {
        Ok(view) => HttpResponse::Ok().json(view),
        Err(e) => runtime_error(e),
    }
}

#[post("/api/runs/{id}/cancel")]
async fn cancel_run(data: web::Data<AppState>, path: web::Path<Uuid>) -> impl Responder {
    let run_id = path.into_inner();
    match data.runtime.cancel(run_id).await {
        Ok(outcome) => {
            info!("Cancel requested for run {}: {:?}", run_id, outcome);
            HttpResponse::Accepted().json(json!({ "outcome": outcome }))
        }
        Err(e) => runtime_error(e),
    }
}

#[get("/api/runs/{id}/events")]
async fn run_events(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
    query: web::Query<EventsQuery>,
) -> impl Responder {
    match data.runtime.events(path.into_inner(), query.since).await {
        Ok(events) => HttpResponse::Ok().json(events),
        Err(e) => runtime_error(e),
    }
}

/// Drop a finished run
#[delete("/api/runs/{id}")]
async fn delete_run(data: web::Data<AppState>, path: web::Path<Uuid>) -> impl Responder {
    let run_id = path.into_inner();
    match data.runtime.forget(run_id).await {
        Ok(true) => {
            info!("Deleted run: {}", run_id);
            HttpResponse::NoContent().finish()
        }
        Ok(false) => HttpResponse::Conflict().json(ErrorResponse {
            error: format!("Run {} is still active", run_id),
        }),
        Err(e) => runtime_error(e),
    }
}

/// WebSocket endpoint: replays the run's event log, then streams live events
#[get("/api/runs/{id}/ws")]
async fn run_websocket(
    req: HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> actix_web::Result<HttpResponse> {
    let run_id = path.into_inner();
    let (backlog, mut events) = match data.runtime.subscribe(run_id).await {
        Ok(subscription) => subscription,
        Err(e) => return Ok(runtime_error(e)),
    };
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    info!("WebSocket client connected to run {}", run_id);

    actix_web::rt::spawn(async move {
        let mut finished = false;
        for event in &backlog {
            finished |= matches!(event.kind, EventKind::RunFinished { .. });
            if let Ok(text) = serde_json::to_string(event) {
                if session.text(text).await.is_err() {
                    return;
                }
            }
        }

        while !finished {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        finished = matches!(event.kind, EventKind::RunFinished { .. });
                        if let Ok(text) = serde_json::to_string(&event) {
                            if session.text(text).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("WebSocket client for run {} lagged by {} events", run_id, skipped);
                    }
                    Err(RecvError::Closed) => break,
                },

                Some(Ok(msg)) = msg_stream.recv() => match msg {
                    Message::Ping(bytes) => {
                        if session.pong(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                },

                else => break,
            }
        }

        info!("WebSocket client disconnected from run {}", run_id);
        let _ = session.close(None).await;
    });

    Ok(res)
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check)
        .service(list_node_types)
        .service(validate_graph)
        .service(submit_run)
        .service(list_runs)
        .service(get_run)
        .service(cancel_run)
        .service(run_events)
        .service(delete_run)
        .service(run_websocket);
}
