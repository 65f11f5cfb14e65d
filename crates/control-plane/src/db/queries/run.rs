//! Run archive queries.

use uuid::Uuid;

use crate::db::models::RunRecord;
use crate::db::DbPool;
use crate::error::AppResult;

/// Create the archive schema and table if missing.
pub async fn ensure_schema(pool: &DbPool) -> AppResult<()> {
    sqlx::query("CREATE SCHEMA IF NOT EXISTS pg_dd")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pg_dd.run (
            run_id      UUID PRIMARY KEY,
            state       TEXT NOT NULL,
            created_at  TIMESTAMPTZ NOT NULL,
            finished_at TIMESTAMPTZ,
            snapshot    JSONB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS run_created_at_idx ON pg_dd.run (created_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Insert a run, or replace the stored copy.
pub async fn upsert_run(pool: &DbPool, record: &RunRecord) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO pg_dd.run (run_id, state, created_at, finished_at, snapshot)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (run_id) DO UPDATE
        SET state = EXCLUDED.state,
            finished_at = EXCLUDED.finished_at,
            snapshot = EXCLUDED.snapshot
        "#,
    )
    .bind(record.run_id)
    .bind(&record.state)
    .bind(record.created_at)
    .bind(record.finished_at)
    .bind(&record.snapshot)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get one archived run.
pub async fn get_run(pool: &DbPool, run_id: Uuid) -> AppResult<Option<RunRecord>> {
    let record = sqlx::query_as::<_, RunRecord>(
        r#"
        SELECT run_id, state, created_at, finished_at, snapshot
        FROM pg_dd.run
        WHERE run_id = $1
        "#,
    )
    .bind(run_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Most recently created runs.
pub async fn list_recent(pool: &DbPool, limit: i64) -> AppResult<Vec<RunRecord>> {
    let records = sqlx::query_as::<_, RunRecord>(
        r#"
        SELECT run_id, state, created_at, finished_at, snapshot
        FROM pg_dd.run
        ORDER BY created_at DESC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(records)
}
