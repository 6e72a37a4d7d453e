use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::auth;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::EngineError;
use crate::metrics::Metrics;
use crate::run::{CancelOutcome, RunController, RunHandle, RunResults, RunStatusView};
use crate::timeseries::{Bucket, TimeSeriesSink};
use crate::traces::{Trace, TraceRequest, TraceStore};

pub struct AppState {
    pub config: Arc<Config>,
    pub catalog: Arc<Catalog>,
    pub controller: Arc<RunController>,
    pub traces: Arc<TraceStore>,
    pub timeseries: Arc<TimeSeriesSink>,
    pub metrics: Arc<Metrics>,
    pub started_at: DateTime<Utc>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/metrics/timeseries", get(timeseries))
        .route("/runs", post(submit_run).get(list_runs))
        .route("/runs/:run_id/status", get(run_status))
        .route("/runs/:run_id/results", get(run_results))
        .route("/runs/:run_id/cancel", post(cancel_run))
        .route("/traces", post(ingest_trace))
        .route("/traces/:trace_id", get(get_trace))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_token,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_secs: i64,
    active_runs: usize,
    total_runs: usize,
    traces_stored: usize,
    max_parallel_workers: usize,
    model_call_capacity: usize,
    model_calls_available: usize,
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let registry = state.controller.registry();
    let limiter = state.controller.limiter();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        active_runs: registry.active_count(),
        total_runs: registry.len(),
        traces_stored: state.traces.len(),
        max_parallel_workers: state.config.max_parallel_workers,
        model_call_capacity: limiter.capacity(),
        model_calls_available: limiter.available(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let body = state.metrics.render_prometheus();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

fn bad_body(rejection: JsonRejection) -> EngineError {
    EngineError::BadRequest(rejection.body_text())
}

fn bad_query(rejection: QueryRejection) -> EngineError {
    EngineError::BadRequest(rejection.body_text())
}

#[derive(Deserialize)]
struct SubmitPayload {
    experiment_id: String,
}

async fn submit_run(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SubmitPayload>, JsonRejection>,
) -> Result<(StatusCode, Json<RunHandle>), EngineError> {
    let Json(payload) = payload.map_err(bad_body)?;
    if payload.experiment_id.trim().is_empty() {
        return Err(EngineError::BadRequest("experiment_id is required".to_string()));
    }
    let handle = state.controller.submit(&payload.experiment_id)?;
    Ok((StatusCode::ACCEPTED, Json(handle)))
}

#[derive(Deserialize)]
struct ListQuery {
    experiment_id: Option<String>,
}

async fn list_runs(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<RunStatusView>>, EngineError> {
    let Query(query) = query.map_err(bad_query)?;
    Ok(Json(
        state.controller.list_runs(query.experiment_id.as_deref()),
    ))
}

async fn run_status(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<RunStatusView>, EngineError> {
    Ok(Json(state.controller.get_status(&run_id)?))
}

#[derive(Deserialize)]
struct ResultsQuery {
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

async fn run_results(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    query: Result<Query<ResultsQuery>, QueryRejection>,
) -> Result<Json<RunResults>, EngineError> {
    let Query(query) = query.map_err(bad_query)?;
    Ok(Json(
        state
            .controller
            .get_results(&run_id, query.offset, query.limit)?,
    ))
}

async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<CancelOutcome>, EngineError> {
    Ok(Json(state.controller.cancel(&run_id)?))
}

#[derive(Serialize)]
struct TraceAccepted {
    trace_id: String,
    message: &'static str,
}

async fn ingest_trace(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TraceRequest>, JsonRejection>,
) -> Result<Json<TraceAccepted>, EngineError> {
    let Json(payload) = payload.map_err(bad_body)?;
    let trace = state
        .traces
        .ingest(payload, &state.catalog, &state.timeseries)?;
    state.metrics.trace_ingested();
    Ok(Json(TraceAccepted {
        trace_id: trace.trace_id.clone(),
        message: "Trace submitted successfully",
    }))
}

async fn get_trace(
    State(state): State<Arc<AppState>>,
    Path(trace_id): Path<String>,
) -> Result<Json<Trace>, EngineError> {
    let trace = state
        .traces
        .get(&trace_id)
        .ok_or_else(|| EngineError::NotFound(format!("Trace {} not found", trace_id)))?;
    Ok(Json(trace.as_ref().clone()))
}

#[derive(Deserialize)]
struct TimeSeriesQuery {
    model: Option<String>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct TimeSeriesResponse {
    bucket_secs: u64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    buckets: Vec<Bucket>,
}

async fn timeseries(
    State(state): State<Arc<AppState>>,
    query: Result<Query<TimeSeriesQuery>, QueryRejection>,
) -> Result<Json<TimeSeriesResponse>, EngineError> {
    let Query(query) = query.map_err(bad_query)?;
    let (default_start, default_end) = TimeSeriesSink::default_window(Utc::now());
    let end = query.end.unwrap_or(default_end);
    let start = query.start.unwrap_or(default_start);
    if start > end {
        return Err(EngineError::BadRequest("start must not be after end".to_string()));
    }

    Ok(Json(TimeSeriesResponse {
        bucket_secs: state.timeseries.bucket_secs(),
        start,
        end,
        buckets: state.timeseries.query(query.model.as_deref(), start, end),
    }))
}
