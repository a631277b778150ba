//! Service for monitor CRUD and the denormalized last-check mirror.

use chrono::{DateTime, Utc};
use duckdb::{params, Result as DuckDbResult, Row};
use uuid::Uuid;

use crate::db::models::{
    normalize_tags, validate_interval, validate_name, validate_pipeline, validate_schedule,
    validate_url, CreateMonitor, Monitor, UpdateMonitor,
};
use crate::db::DbPool;
use crate::stages::{StageSpec, Status};
use crate::web::error::AppError;

fn row_to_monitor(row: &Row) -> DuckDbResult<Monitor> {
    let pipeline_raw: String = row.get("pipeline")?;
    let pipeline: Vec<StageSpec> = serde_json::from_str(&pipeline_raw).map_err(|e| {
        duckdb::Error::FromSqlConversionFailure(0, duckdb::types::Type::Text, Box::new(e))
    })?;
    let tags_raw: String = row.get("tags")?;
    let tags: Vec<String> = serde_json::from_str(&tags_raw).map_err(|e| {
        duckdb::Error::FromSqlConversionFailure(0, duckdb::types::Type::Text, Box::new(e))
    })?;
    let last_status: Option<String> = row.get("last_status")?;

    Ok(Monitor {
        id: row.get("id")?,
        name: row.get("name")?,
        url: row.get("url")?,
        pipeline,
        interval: row.get::<_, i64>("interval_seconds")? as u32,
        schedule: row.get("schedule")?,
        enabled: row.get("enabled")?,
        tags,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        last_check: row.get("last_check")?,
        last_status: last_status.as_deref().and_then(Status::parse),
    })
}

fn validate_create(data: &CreateMonitor) -> Result<(String, String), AppError> {
    let name = validate_name(&data.name)?;
    let url = validate_url(&data.url)?;
    validate_interval(data.interval)?;
    if let Some(schedule) = &data.schedule {
        validate_schedule(schedule)?;
    }
    validate_pipeline(&data.pipeline)?;
    Ok((name, url))
}

pub async fn create_monitor(pool: DbPool, data: CreateMonitor) -> Result<Monitor, AppError> {
    let (name, url) = validate_create(&data)?;
    let now = crate::db::models::now_millis();
    let monitor = Monitor {
        id: Uuid::new_v4().to_string(),
        name,
        url,
        pipeline: data.pipeline,
        interval: data.interval,
        schedule: data.schedule,
        enabled: data.enabled,
        tags: normalize_tags(data.tags),
        created_at: now,
        updated_at: now,
        last_check: None,
        last_status: None,
    };

    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO monitors (id, name, url, pipeline, interval_seconds, schedule, enabled, tags, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            monitor.id,
            monitor.name,
            monitor.url,
            serde_json::to_string(&monitor.pipeline)?,
            monitor.interval as i64,
            monitor.schedule,
            monitor.enabled,
            serde_json::to_string(&monitor.tags)?,
            monitor.created_at,
            monitor.updated_at,
        ],
    )?;

    Ok(monitor)
}

pub async fn get_monitor(pool: DbPool, id: &str) -> Result<Option<Monitor>, AppError> {
    let conn = pool.get()?;
    match conn.query_row(
        "SELECT * FROM monitors WHERE id = ?",
        params![id],
        row_to_monitor,
    ) {
        Ok(monitor) => Ok(Some(monitor)),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub async fn list_monitors(pool: DbPool, tag: Option<&str>) -> Result<Vec<Monitor>, AppError> {
    let conn = pool.get()?;
    let monitors: Vec<Monitor> = conn
        .prepare("SELECT * FROM monitors ORDER BY created_at, id")?
        .query_map([], row_to_monitor)?
        .collect::<Result<Vec<_>, _>>()?;

    // Tag filtering is a set-membership test over the JSON tag list.
    Ok(match tag {
        Some(tag) => monitors
            .into_iter()
            .filter(|m| m.tags.iter().any(|t| t == tag))
            .collect(),
        None => monitors,
    })
}

/// Union of all monitors' tags, sorted lexicographically.
pub async fn list_tags(pool: DbPool) -> Result<Vec<String>, AppError> {
    let monitors = list_monitors(pool, None).await?;
    let tags: std::collections::BTreeSet<String> =
        monitors.into_iter().flat_map(|m| m.tags).collect();
    Ok(tags.into_iter().collect())
}

/// Apply a patch. Returns the updated monitor and whether a scheduling-
/// relevant field (interval, schedule, enabled) changed; cosmetic updates do
/// not disturb the scheduler.
pub async fn update_monitor(
    pool: DbPool,
    id: &str,
    patch: UpdateMonitor,
) -> Result<Option<(Monitor, bool)>, AppError> {
    let Some(mut monitor) = get_monitor(pool.clone(), id).await? else {
        return Ok(None);
    };
    let before_interval = monitor.interval;
    let before_schedule = monitor.schedule.clone();
    let before_enabled = monitor.enabled;

    if let Some(name) = patch.name {
        monitor.name = validate_name(&name)?;
    }
    if let Some(url) = patch.url {
        monitor.url = validate_url(&url)?;
    }
    if let Some(pipeline) = patch.pipeline {
        validate_pipeline(&pipeline)?;
        monitor.pipeline = pipeline;
    }
    if let Some(interval) = patch.interval {
        validate_interval(interval)?;
        monitor.interval = interval;
    }
    if let Some(schedule) = patch.schedule {
        if let Some(expr) = &schedule {
            validate_schedule(expr)?;
        }
        monitor.schedule = schedule;
    }
    if let Some(enabled) = patch.enabled {
        monitor.enabled = enabled;
    }
    if let Some(tags) = patch.tags {
        monitor.tags = normalize_tags(tags);
    }
    monitor.updated_at = crate::db::models::now_millis();

    let conn = pool.get()?;
    conn.execute(
        "UPDATE monitors
         SET name = ?, url = ?, pipeline = ?, interval_seconds = ?, schedule = ?, enabled = ?, tags = ?, updated_at = ?
         WHERE id = ?",
        params![
            monitor.name,
            monitor.url,
            serde_json::to_string(&monitor.pipeline)?,
            monitor.interval as i64,
            monitor.schedule,
            monitor.enabled,
            serde_json::to_string(&monitor.tags)?,
            monitor.updated_at,
            monitor.id,
        ],
    )?;

    let trigger_changed = monitor.interval != before_interval
        || monitor.schedule != before_schedule
        || monitor.enabled != before_enabled;
    Ok(Some((monitor, trigger_changed)))
}

/// Delete a monitor. Existing results are kept as orphan history.
pub async fn delete_monitor(pool: DbPool, id: &str) -> Result<bool, AppError> {
    let conn = pool.get()?;
    let deleted = conn.execute("DELETE FROM monitors WHERE id = ?", params![id])?;
    Ok(deleted > 0)
}

/// Lightweight denormalization of the newest result; losing it is harmless,
/// it is re-derivable from the results log.
pub async fn update_monitor_mirror(
    pool: DbPool,
    id: &str,
    last_check: DateTime<Utc>,
    last_status: Status,
) -> Result<(), AppError> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE monitors SET last_check = ?, last_status = ? WHERE id = ?",
        params![last_check, last_status.as_str(), id],
    )?;
    Ok(())
}
