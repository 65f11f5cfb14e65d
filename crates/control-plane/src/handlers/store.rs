//! Output store policy endpoint.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::Value;

use crate::contract::validate_bucket;
use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyQuery {
    pub bucket: Option<String>,
}

/// Render the output bucket's policy document.
///
/// GET /api/store/policy?bucket=
///
/// Defaults to the bucket of the default contract.
pub async fn policy(
    State(state): State<AppState>,
    Query(query): Query<PolicyQuery>,
) -> AppResult<Json<Value>> {
    let bucket = query
        .bucket
        .or_else(|| {
            state
                .default_contract
                .as_ref()
                .and_then(|c| c.output.bucket.clone())
        })
        .ok_or_else(|| AppError::BadRequest("no bucket given or configured".to_string()))?;
    validate_bucket(&bucket)?;

    Ok(Json(state.store_policy.document(&bucket)))
}
