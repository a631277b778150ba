//! Persisted scheduler job state. The scheduler owns this collection; nothing
//! else reads it.

use duckdb::{params, Result as DuckDbResult, Row};

use crate::db::models::SchedulerJobRecord;
use crate::db::DbPool;
use crate::web::error::AppError;

fn row_to_job(row: &Row) -> DuckDbResult<SchedulerJobRecord> {
    Ok(SchedulerJobRecord {
        monitor_id: row.get("monitor_id")?,
        trigger_kind: row.get("trigger_kind")?,
        trigger_spec: row.get("trigger_spec")?,
        next_run_at: row.get("next_run_at")?,
        last_updated: row.get("last_updated")?,
    })
}

pub async fn upsert_job(pool: DbPool, job: &SchedulerJobRecord) -> Result<(), AppError> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO scheduler_jobs (monitor_id, trigger_kind, trigger_spec, next_run_at, last_updated)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT (monitor_id) DO UPDATE SET
             trigger_kind = excluded.trigger_kind,
             trigger_spec = excluded.trigger_spec,
             next_run_at = excluded.next_run_at,
             last_updated = excluded.last_updated",
        params![
            job.monitor_id,
            job.trigger_kind,
            job.trigger_spec,
            job.next_run_at,
            job.last_updated,
        ],
    )?;
    Ok(())
}

pub async fn delete_job(pool: DbPool, monitor_id: &str) -> Result<(), AppError> {
    let conn = pool.get()?;
    conn.execute(
        "DELETE FROM scheduler_jobs WHERE monitor_id = ?",
        params![monitor_id],
    )?;
    Ok(())
}

pub async fn list_jobs(pool: DbPool) -> Result<Vec<SchedulerJobRecord>, AppError> {
    let conn = pool.get()?;
    let jobs = conn
        .prepare("SELECT * FROM scheduler_jobs ORDER BY monitor_id")?
        .query_map([], row_to_job)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(jobs)
}
