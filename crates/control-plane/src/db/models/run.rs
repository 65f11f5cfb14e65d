//! Archived run rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::engine::RunSnapshot;

/// A row of `pg_dd.run`.
///
/// The full snapshot is kept as JSONB; `state` and the timestamps are
/// duplicated into columns for querying.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub snapshot: serde_json::Value,
}

impl RunRecord {
    pub fn from_snapshot(snapshot: &RunSnapshot) -> Result<Self, serde_json::Error> {
        Ok(Self {
            run_id: *snapshot.run_id.as_uuid(),
            state: snapshot.state.as_str().to_string(),
            created_at: snapshot.created_at,
            finished_at: snapshot.finished_at,
            snapshot: serde_json::to_value(snapshot)?,
        })
    }

    pub fn into_snapshot(self) -> Result<RunSnapshot, serde_json::Error> {
        serde_json::from_value(self.snapshot)
    }
}
