use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use tripwire_core::error::TripwireError;
use tripwire_core::metric::MetricSample;
use tripwire_core::types::{FlowId, RunFilter, RunId};
use tripwire_engine::{AuthoringFlow, FlowGraph};

use crate::state::AppState;

/// Engine error rendered as a JSON body with a matching status code.
pub struct ApiError(TripwireError);

impl From<TripwireError> for ApiError {
    fn from(e: TripwireError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TripwireError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            TripwireError::FlowNotFound(_)
            | TripwireError::TriggerNotFound { .. }
            | TripwireError::RunNotFound(_) => StatusCode::NOT_FOUND,
            TripwireError::VersionConflict { .. }
            | TripwireError::StaleVersion { .. }
            | TripwireError::FlowInactive(_)
            | TripwireError::NotAwaitingApproval(_)
            | TripwireError::NotCancellable(_) => StatusCode::CONFLICT,
            TripwireError::Config(_) | TripwireError::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        let mut body = json!({ "error": self.0.to_string() });
        if let TripwireError::Validation(errors) = &self.0 {
            body["violations"] = errors.iter().map(|e| e.to_string()).collect();
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

// GET /api/health
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Flows ───────────────────────────────────────────────────────

// GET /api/flows
pub async fn list_flows(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({ "flows": state.engine.flows() }))
}

#[derive(Deserialize)]
pub struct FlowQuery {
    #[serde(default)]
    pub version: Option<u64>,
}

// GET /api/flows/{id}?version=N
pub async fn get_flow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<FlowQuery>,
) -> ApiResult {
    let flow = state.engine.flow(&FlowId::from_string(&id), q.version)?;
    Ok(Json(json!(flow)))
}

// POST /api/flows
pub async fn submit_flow(
    State(state): State<Arc<AppState>>,
    Json(flow): Json<FlowGraph>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let summary = state.engine.submit(flow).await?;
    Ok((StatusCode::CREATED, Json(json!(summary))))
}

// POST /api/flows/authoring
pub async fn submit_authoring(
    State(state): State<Arc<AppState>>,
    Json(flow): Json<AuthoringFlow>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let summary = state.engine.submit_authoring(flow).await?;
    Ok((StatusCode::CREATED, Json(json!(summary))))
}

// POST /api/flows/{id}/retire
pub async fn retire_flow(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let flow_id = FlowId::from_string(&id);
    let version = state.engine.retire(&flow_id).await?;
    Ok(Json(json!({ "flow_id": flow_id, "retired_version": version })))
}

// POST /api/flows/{id}/triggers/{trigger}/fire
pub async fn fire_trigger(
    State(state): State<Arc<AppState>>,
    Path((id, trigger)): Path<(String, String)>,
) -> ApiResult {
    let result = state
        .engine
        .fire_manual(&FlowId::from_string(&id), &trigger)
        .await?;
    info!(flow_id = %id, trigger = %trigger, "Manual fire via gateway");
    Ok(Json(json!(result)))
}

// GET /api/flows/{id}/runs?status=failed&limit=20
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(filter): Query<RunFilter>,
) -> ApiResult {
    let runs = state
        .engine
        .list_runs(&FlowId::from_string(&id), &filter)
        .await?;
    Ok(Json(json!({ "runs": runs })))
}

// ── Ingestion ───────────────────────────────────────────────────

/// A single sample or a batch.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum SamplesBody {
    One(MetricSample),
    Many(Vec<MetricSample>),
}

// POST /api/metrics/{source}
pub async fn push_metrics(
    State(state): State<Arc<AppState>>,
    Path(source): Path<String>,
    Json(body): Json<SamplesBody>,
) -> ApiResult {
    let samples = match body {
        SamplesBody::One(s) => vec![s],
        SamplesBody::Many(v) => v,
    };
    let accepted = samples.len();
    let mut results = Vec::new();
    for sample in samples {
        results.extend(state.engine.push(&source, sample).await?);
    }
    debug!(source = %source, accepted, fired = results.len(), "Metric samples ingested");
    Ok(Json(json!({ "accepted": accepted, "results": results })))
}

// POST /api/events/{source}
pub async fn emit_event(State(state): State<Arc<AppState>>, Path(source): Path<String>) -> ApiResult {
    let results = state.engine.emit(&source).await?;
    Ok(Json(json!({ "results": results })))
}

// ── Approvals ───────────────────────────────────────────────────

// GET /api/approvals
pub async fn list_approvals(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({ "approvals": state.engine.pending_approvals().await }))
}

// POST /api/approvals/{run_id}/approve
pub async fn approve(State(state): State<Arc<AppState>>, Path(run_id): Path<String>) -> ApiResult {
    let run_id = resolve_run(&state, &run_id).await;
    state.engine.approve(&run_id).await?;
    Ok(Json(json!({ "run_id": run_id, "approved": true })))
}

#[derive(Deserialize, Default)]
pub struct RejectBody {
    #[serde(default)]
    pub reason: Option<String>,
}

// POST /api/approvals/{run_id}/reject
pub async fn reject(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    body: Option<Json<RejectBody>>,
) -> ApiResult {
    let run_id = resolve_run(&state, &run_id).await;
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "rejected via gateway".to_string());
    let record = state.engine.reject(&run_id, &reason).await?;
    Ok(Json(json!(record)))
}

/// Accept a pending run id or a unique prefix of one.
async fn resolve_run(state: &AppState, id: &str) -> RunId {
    state
        .engine
        .approvals()
        .resolve(id)
        .await
        .unwrap_or_else(|| RunId::from_string(id))
}

// ── Runs ────────────────────────────────────────────────────────

// GET /api/runs/{id}
pub async fn get_run(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let run_id = RunId::from_string(&id);
    match state.engine.get_run(&run_id).await? {
        Some(record) => Ok(Json(json!(record))),
        None => Err(TripwireError::RunNotFound(id).into()),
    }
}

// POST /api/runs/{id}/cancel
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let run_id = RunId::from_string(&id);
    state.engine.cancel(&run_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "run_id": run_id, "cancel_requested": true })),
    ))
}
