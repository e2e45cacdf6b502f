use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use chrono::Utc;
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::app::orchestrator::{Orchestrator, RunReport};
use crate::app::store::Store;
use crate::health::HealthSummary;
use crate::model::Source;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<dyn Store>,
    pub health_top_n: usize,
    /// Refreshed after every manual run when set.
    pub health_path: Option<PathBuf>,
    run_lock: Arc<tokio::sync::Mutex<()>>,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        store: Arc<dyn Store>,
        health_top_n: usize,
        health_path: Option<PathBuf>,
    ) -> Self {
        Self {
            orchestrator,
            store,
            health_top_n,
            health_path,
            run_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

type ApiError = (StatusCode, String);

fn internal(err: anyhow::Error) -> ApiError {
    tracing::error!(error = %format!("{err:#}"), "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok\n" }))
        .route("/api/health", get(health))
        .route("/api/sources", get(sources))
        .route("/api/runs", post(trigger_run))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Result<Json<HealthSummary>, ApiError> {
    let sources = state.store.list_sources().await.map_err(internal)?;
    Ok(Json(HealthSummary::build(
        &sources,
        state.health_top_n,
        Utc::now(),
    )))
}

async fn sources(State(state): State<AppState>) -> Result<Json<Vec<Source>>, ApiError> {
    let sources = state.store.list_sources().await.map_err(internal)?;
    Ok(Json(sources))
}

#[derive(Debug, Serialize)]
struct RunResponse {
    status: &'static str,
    #[serde(flatten)]
    report: RunReport,
}

async fn trigger_run(State(state): State<AppState>) -> Result<Json<RunResponse>, ApiError> {
    let Ok(_guard) = state.run_lock.try_lock() else {
        return Err((StatusCode::CONFLICT, "a run is already in progress".to_owned()));
    };

    let report = state
        .orchestrator
        .run_once(Utc::now())
        .await
        .map_err(internal)?;

    if let Some(path) = &state.health_path {
        let sources = state.store.list_sources().await.map_err(internal)?;
        HealthSummary::build(&sources, state.health_top_n, Utc::now())
            .write_json(path)
            .await
            .map_err(internal)?;
    }

    let status = if report.is_partial() { "partial" } else { "ok" };
    Ok(Json(RunResponse { status, report }))
}
