//! Worker callback endpoints.
//!
//! Rejected and discarded callbacks get the same answer so a caller cannot
//! probe which runs exist or which tokens are live.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{CallbackSignal, SignalOutcome};
use crate::ids::RunId;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct SuccessCallback {
    pub run_id: RunId,
    pub token: String,
    #[serde(default)]
    pub output: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FailureCallback {
    pub run_id: RunId,
    pub token: String,
    pub error: String,
    #[serde(default)]
    pub cause: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatCallback {
    pub run_id: RunId,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackResponse {
    pub status: String,
}

impl From<SignalOutcome> for CallbackResponse {
    fn from(outcome: SignalOutcome) -> Self {
        let status = match outcome {
            SignalOutcome::Applied => "applied",
            SignalOutcome::Recorded => "recorded",
            SignalOutcome::Rejected | SignalOutcome::Discarded => "ignored",
        };
        Self {
            status: status.to_string(),
        }
    }
}

/// POST /api/callbacks/success
pub async fn success(
    State(state): State<AppState>,
    Json(callback): Json<SuccessCallback>,
) -> Json<CallbackResponse> {
    let outcome = state
        .coordinator
        .signal(
            &callback.run_id,
            &callback.token,
            CallbackSignal::Success {
                output: callback.output,
            },
        )
        .await;
    Json(outcome.into())
}

/// POST /api/callbacks/failure
pub async fn failure(
    State(state): State<AppState>,
    Json(callback): Json<FailureCallback>,
) -> Json<CallbackResponse> {
    let outcome = state
        .coordinator
        .signal(
            &callback.run_id,
            &callback.token,
            CallbackSignal::Failure {
                error: callback.error,
                cause: callback.cause,
            },
        )
        .await;
    Json(outcome.into())
}

/// POST /api/callbacks/heartbeat
pub async fn heartbeat(
    State(state): State<AppState>,
    Json(callback): Json<HeartbeatCallback>,
) -> Json<CallbackResponse> {
    let outcome = state
        .coordinator
        .signal(&callback.run_id, &callback.token, CallbackSignal::Heartbeat)
        .await;
    Json(outcome.into())
}
