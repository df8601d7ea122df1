//! Sage HTTP 服务
//!
//! 启动: cargo run --bin sage-server --features server
//! 接口：POST /query、POST /reset、GET /schema、GET /sample、GET /health

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use sage::api::{
    sample_status_code, status_code, HealthResponse, QueryRequest, QueryResponse, ResetRequest, ResetResponse,
    SampleQuery, SampleResponse,
};
use sage::config::load_config;
use sage::core::{Orchestrator, OrchestratorBuilder};

struct AppState {
    orchestrator: Orchestrator,
    table: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sage::observability::init();

    let cfg = load_config(None).context("Failed to load configuration")?;
    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    let cleanup_every = Duration::from_secs(cfg.app.session_timeout_secs.clamp(60, 3600));
    let table = cfg.data.table_name.clone();

    let orchestrator = OrchestratorBuilder::new(cfg).build().context("Failed to initialise")?;
    let state = Arc::new(AppState { orchestrator, table });

    // 定期回收空闲会话
    let sessions = Arc::clone(state.orchestrator.sessions());
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_every);
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = sessions.cleanup_expired().await;
            if removed > 0 {
                tracing::info!("Evicted {} idle sessions", removed);
            }
        }
    });

    let app = Router::new()
        .route("/query", post(api_query))
        .route("/reset", post(api_reset))
        .route("/schema", get(api_schema))
        .route("/sample", get(api_sample))
        .route("/health", get(api_health))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Sage server: http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to listen for ctrl_c: {}", e);
                return std::future::pending().await;
            }
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}

async fn api_query(State(state): State<Arc<AppState>>, Json(req): Json<QueryRequest>) -> impl IntoResponse {
    let outcome = state
        .orchestrator
        .process_query(req.session_id.as_deref(), &req.query)
        .await;
    let status = StatusCode::from_u16(status_code(&outcome)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(QueryResponse::from(outcome)))
}

async fn api_reset(State(state): State<Arc<AppState>>, Json(req): Json<ResetRequest>) -> impl IntoResponse {
    let reset = state.orchestrator.reset(&req.session_id).await;
    let status = if reset { StatusCode::OK } else { StatusCode::NOT_FOUND };
    (
        status,
        Json(ResetResponse {
            session_id: req.session_id,
            reset,
        }),
    )
}

async fn api_schema(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let tables: Vec<_> = state.orchestrator.catalog().tables().cloned().collect();
    Json(tables)
}

async fn api_sample(State(state): State<Arc<AppState>>, Query(q): Query<SampleQuery>) -> Response {
    match state.orchestrator.sample(&state.table, q.limit).await {
        Ok(rows) => Json(SampleResponse::from(rows)).into_response(),
        Err(failure) => {
            tracing::warn!("Sample query failed: {}", failure);
            let status = StatusCode::from_u16(sample_status_code(&failure))
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(serde_json::json!({ "error": failure.message }))).into_response()
        }
    }
}

async fn api_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        sessions: state.orchestrator.sessions().len().await,
    })
}
