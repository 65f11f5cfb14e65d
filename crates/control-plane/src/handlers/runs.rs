//! Run dispatch and inspection API handlers.

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::contract::WorkerContract;
use crate::engine::{RunSnapshot, RunState};
use crate::error::{AppError, AppResult};
use crate::ids::RunId;
use crate::state::AppState;

/// Longest a single wait request may block.
const MAX_WAIT_SECS: u64 = 300;
const DEFAULT_WAIT_SECS: u64 = 30;
const DEFAULT_CANCEL_REASON: &str = "cancelled by operator";

/// Request to start one export run.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchRequest {
    /// Arguments handed to the worker, rendered as templates first.
    pub commands: Vec<String>,

    /// Contract for this run; the server default is used when absent.
    #[serde(default)]
    pub contract: Option<WorkerContract>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub run_id: RunId,
    pub callback_token: String,
    pub state: RunState,
    pub output_prefix: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListRunsQuery {
    pub state: Option<RunState>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WaitQuery {
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

/// Start a run.
///
/// POST /api/runs
pub async fn dispatch(
    State(state): State<AppState>,
    Json(request): Json<DispatchRequest>,
) -> AppResult<(StatusCode, Json<DispatchResponse>)> {
    let contract = match request.contract {
        Some(contract) => contract,
        None => state
            .default_contract
            .as_deref()
            .cloned()
            .ok_or_else(|| AppError::Validation("no worker contract configured".to_string()))?,
    };

    let dispatched = state.coordinator.dispatch(request.commands, contract).await?;

    Ok((
        StatusCode::CREATED,
        Json(DispatchResponse {
            run_id: dispatched.run_id,
            callback_token: dispatched.token.as_str().to_string(),
            state: dispatched.snapshot.state,
            output_prefix: dispatched.snapshot.output_prefix,
        }),
    ))
}

/// List runs, newest first.
///
/// GET /api/runs
///
/// Runs still held in memory come first; older ones are filled in from the
/// archive when one is configured.
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> AppResult<Json<Vec<RunSnapshot>>> {
    let limit = query.limit.unwrap_or(100);
    let mut runs = state.coordinator.list().await;

    if runs.len() < limit {
        if let Some(archive) = state.coordinator.archive() {
            let archived = archive.recent(limit).await?;
            for snapshot in archived {
                if !runs.iter().any(|r| r.run_id == snapshot.run_id) {
                    runs.push(snapshot);
                }
            }
            runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        }
    }

    if let Some(wanted) = query.state {
        runs.retain(|r| r.state == wanted);
    }
    runs.truncate(limit);
    Ok(Json(runs))
}

/// Get one run.
///
/// GET /api/runs/{run_id}
pub async fn get(
    State(state): State<AppState>,
    Path(run_id): Path<RunId>,
) -> AppResult<Json<RunSnapshot>> {
    state
        .coordinator
        .snapshot(&run_id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("run {run_id}")))
}

/// Block until the run settles or the timeout passes.
///
/// GET /api/runs/{run_id}/wait?timeout_secs=
pub async fn wait(
    State(state): State<AppState>,
    Path(run_id): Path<RunId>,
    Query(query): Query<WaitQuery>,
) -> AppResult<Json<RunSnapshot>> {
    let secs = query
        .timeout_secs
        .unwrap_or(DEFAULT_WAIT_SECS)
        .min(MAX_WAIT_SECS);
    state
        .coordinator
        .wait(&run_id, Duration::from_secs(secs))
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("run {run_id}")))
}

/// Force a run to `failed`.
///
/// POST /api/runs/{run_id}/cancel
///
/// The body is optional.
pub async fn cancel(
    State(state): State<AppState>,
    Path(run_id): Path<RunId>,
    body: Bytes,
) -> AppResult<Json<RunSnapshot>> {
    let request: CancelRequest = if body.is_empty() {
        CancelRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::BadRequest(e.to_string()))?
    };
    let reason = request
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());

    state
        .coordinator
        .cancel(&run_id, &reason)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("run {run_id}")))
}
