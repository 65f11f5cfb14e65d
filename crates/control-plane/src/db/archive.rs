//! Postgres-backed run archive.

use async_trait::async_trait;

use super::models::RunRecord;
use super::pool::health_check;
use super::queries::run as queries;
use super::DbPool;
use crate::engine::{RunArchive, RunSnapshot, SinkError};
use crate::ids::RunId;

/// Stores run snapshots in `pg_dd.run`.
#[derive(Clone)]
pub struct PgRunArchive {
    pool: DbPool,
}

impl PgRunArchive {
    /// Wrap a pool and make sure the archive table exists.
    pub async fn connect(pool: DbPool) -> Result<Self, SinkError> {
        queries::ensure_schema(&pool)
            .await
            .map_err(|e| SinkError::Archive(e.to_string()))?;
        tracing::info!("Run archive schema ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

fn decode(record: RunRecord) -> Result<RunSnapshot, SinkError> {
    let run_id = record.run_id;
    record
        .into_snapshot()
        .map_err(|e| SinkError::Archive(format!("corrupt snapshot for run {run_id}: {e}")))
}

#[async_trait]
impl RunArchive for PgRunArchive {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    async fn store(&self, snapshot: &RunSnapshot) -> Result<(), SinkError> {
        let record =
            RunRecord::from_snapshot(snapshot).map_err(|e| SinkError::Archive(e.to_string()))?;
        queries::upsert_run(&self.pool, &record)
            .await
            .map_err(|e| SinkError::Archive(e.to_string()))
    }

    async fn load(&self, run_id: &RunId) -> Result<Option<RunSnapshot>, SinkError> {
        let record = queries::get_run(&self.pool, *run_id.as_uuid())
            .await
            .map_err(|e| SinkError::Archive(e.to_string()))?;
        record.map(decode).transpose()
    }

    async fn recent(&self, limit: usize) -> Result<Vec<RunSnapshot>, SinkError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let records = queries::list_recent(&self.pool, limit)
            .await
            .map_err(|e| SinkError::Archive(e.to_string()))?;
        records.into_iter().map(decode).collect()
    }

    async fn healthy(&self) -> bool {
        health_check(&self.pool).await
    }
}
