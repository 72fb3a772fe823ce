//! JSON-over-HTTP control surface, built with axum the same way the
//! rest of the daemon's surfaces share one `CommandContext`.

use crate::commands::CommandContext;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use tracing::{info, warn};

#[derive(Serialize)]
struct WorkerStatusJson {
    #[serde(rename = "programName")]
    program_name: String,
    #[serde(rename = "processNumber")]
    process_number: usize,
    #[serde(rename = "processId")]
    process_id: Option<u32>,
    state: String,
    #[serde(rename = "startTime")]
    start_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(rename = "restartCount")]
    restart_count: u32,
}

pub fn router(ctx: CommandContext) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/programs/:name/start", post(start_program))
        .route("/api/programs/:name/stop", post(stop_program))
        .route("/api/programs/:name/restart", post(restart_program))
        .route("/api/reload", post(reload))
        .route("/api/shutdown", post(shutdown))
        .fallback(not_found)
        .with_state(ctx)
}

pub async fn serve(addr: SocketAddr, ctx: CommandContext) -> std::io::Result<()> {
    let shutdown = ctx.shutdown.clone();
    let app = router(ctx);
    info!(%addr, "HTTP API listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn status(State(ctx): State<CommandContext>) -> impl IntoResponse {
    match ctx.supervisor.status(None).await {
        Ok(statuses) => {
            let mut out = Vec::new();
            for program in statuses {
                for worker in program.workers {
                    out.push(WorkerStatusJson {
                        program_name: program.name.clone(),
                        process_number: worker.index,
                        process_id: worker.pid,
                        state: crate::format::state_label(worker.state).to_string(),
                        start_time: worker.started_at_wall,
                        restart_count: worker.restart_count,
                    });
                }
            }
            Json(out).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn start_program(State(ctx): State<CommandContext>, Path(name): Path<String>) -> impl IntoResponse {
    match ctx.supervisor.start(&name).await {
        Ok(()) => "ok".into_response(),
        Err(e) => {
            warn!(program = %name, error = %e, "http start failed");
            (StatusCode::BAD_REQUEST, "error").into_response()
        }
    }
}

async fn stop_program(State(ctx): State<CommandContext>, Path(name): Path<String>) -> impl IntoResponse {
    match ctx.supervisor.stop(&name, false).await {
        Ok(()) => "ok".into_response(),
        Err(e) => {
            warn!(program = %name, error = %e, "http stop failed");
            (StatusCode::BAD_REQUEST, "error").into_response()
        }
    }
}

async fn restart_program(State(ctx): State<CommandContext>, Path(name): Path<String>) -> impl IntoResponse {
    match ctx.supervisor.restart(&name, false).await {
        Ok(()) => "ok".into_response(),
        Err(e) => {
            warn!(program = %name, error = %e, "http restart failed");
            (StatusCode::BAD_REQUEST, "error").into_response()
        }
    }
}

async fn reload(State(ctx): State<CommandContext>) -> impl IntoResponse {
    match taskmaster_config::load(&ctx.config_path) {
        Ok(catalog) => {
            for warning in &catalog.warnings {
                warn!(%warning, "program dropped during reload");
            }
            ctx.supervisor.reload(catalog.programs).await;
            "ok".into_response()
        }
        Err(e) => {
            warn!(error = %e, "http reload failed");
            (StatusCode::BAD_REQUEST, "error").into_response()
        }
    }
}

async fn shutdown(State(ctx): State<CommandContext>) -> impl IntoResponse {
    ctx.shutdown.cancel();
    "shutting down"
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}
