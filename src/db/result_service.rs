//! Append-only check-result log with bounded per-monitor retention.

use duckdb::{params, Result as DuckDbResult, Row};
use serde_json::Value;

use crate::db::models::CheckResultRecord;
use crate::db::{json_from_row, DbPool};
use crate::stages::Status;
use crate::web::error::AppError;

pub const MAX_LIST_LIMIT: usize = 10_000;

fn row_to_result(row: &Row) -> DuckDbResult<CheckResultRecord> {
    let status_raw: String = row.get("status")?;
    Ok(CheckResultRecord {
        id: row.get("id")?,
        monitor_id: row.get("monitor_id")?,
        status: Status::parse(&status_raw).unwrap_or(Status::Down),
        message: row.get("message")?,
        elapsed_ms: row.get("elapsed_ms")?,
        details: json_from_row(row, "details")?.unwrap_or(Value::Null),
        checked_at: row.get("checked_at")?,
    })
}

/// Insert a result (idempotent by id), then evict the oldest results for the
/// monitor until at most `retention` remain.
pub async fn append_result(
    pool: DbPool,
    result: &CheckResultRecord,
    retention: usize,
) -> Result<(), AppError> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO check_results (id, monitor_id, status, message, elapsed_ms, details, checked_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (id) DO NOTHING",
        params![
            result.id,
            result.monitor_id,
            result.status.as_str(),
            result.message,
            result.elapsed_ms,
            serde_json::to_string(&result.details)?,
            result.checked_at,
        ],
    )?;

    conn.execute(
        "DELETE FROM check_results
         WHERE monitor_id = ?
           AND id NOT IN (
               SELECT id FROM check_results
               WHERE monitor_id = ?
               ORDER BY checked_at DESC, id DESC
               LIMIT ?
           )",
        params![result.monitor_id, result.monitor_id, retention as i64],
    )?;

    Ok(())
}

/// Newest-first results for a monitor; `limit` is clamped to 10 000.
pub async fn list_results(
    pool: DbPool,
    monitor_id: &str,
    limit: usize,
) -> Result<Vec<CheckResultRecord>, AppError> {
    let limit = limit.clamp(1, MAX_LIST_LIMIT);
    let conn = pool.get()?;
    let results = conn
        .prepare(
            "SELECT * FROM check_results
             WHERE monitor_id = ?
             ORDER BY checked_at DESC, id DESC
             LIMIT ?",
        )?
        .query_map(params![monitor_id, limit as i64], row_to_result)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_pool;
    use chrono::{Duration, Utc};

    fn record(monitor_id: &str, seq: i64) -> CheckResultRecord {
        CheckResultRecord {
            id: format!("r{seq}"),
            monitor_id: monitor_id.to_string(),
            status: Status::Up,
            message: format!("http: {seq}"),
            elapsed_ms: 12.5,
            details: serde_json::json!({"http": {"status_code": 200}}),
            checked_at: Utc::now() + Duration::seconds(seq),
        }
    }

    #[tokio::test]
    async fn retention_keeps_only_the_newest() {
        let (_dir, pool) = temp_pool();
        for seq in 0..5 {
            append_result(pool.clone(), &record("m1", seq), 3).await.unwrap();
        }
        let results = list_results(pool, "m1", 10).await.unwrap();
        assert_eq!(results.len(), 3);
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r4", "r3", "r2"]);
    }

    #[tokio::test]
    async fn append_is_idempotent_by_id() {
        let (_dir, pool) = temp_pool();
        let r = record("m1", 1);
        append_result(pool.clone(), &r, 10).await.unwrap();
        append_result(pool.clone(), &r, 10).await.unwrap();
        assert_eq!(list_results(pool, "m1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retention_is_per_monitor() {
        let (_dir, pool) = temp_pool();
        for seq in 0..4 {
            append_result(pool.clone(), &record("m1", seq), 2).await.unwrap();
        }
        let other = CheckResultRecord {
            id: "other".to_string(),
            monitor_id: "m2".to_string(),
            ..record("m2", 0)
        };
        append_result(pool.clone(), &other, 2).await.unwrap();

        assert_eq!(list_results(pool.clone(), "m1", 10).await.unwrap().len(), 2);
        assert_eq!(list_results(pool, "m2", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn details_round_trip_as_json() {
        let (_dir, pool) = temp_pool();
        let r = record("m1", 1);
        append_result(pool.clone(), &r, 10).await.unwrap();
        let fetched = &list_results(pool, "m1", 1).await.unwrap()[0];
        assert_eq!(fetched.details, r.details);
        assert_eq!(fetched.status, Status::Up);
    }
}
