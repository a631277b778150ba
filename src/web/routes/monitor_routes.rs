use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::error;

use crate::db::models::{CheckResultRecord, CreateMonitor, Monitor, UpdateMonitor};
use crate::db::{monitor_service, result_service};
use crate::pipeline;
use crate::web::{error::AppError, AppState};

pub fn create_monitor_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_monitors).post(create_monitor))
        .route("/tags", get(list_tags))
        .route("/check-all", post(check_all))
        .route(
            "/{id}",
            get(get_monitor).put(update_monitor).delete(delete_monitor),
        )
        .route("/{id}/check", post(run_check))
        .route("/{id}/results", get(get_results))
}

#[derive(Debug, Deserialize)]
pub struct TagQuery {
    pub tag: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    pub limit: Option<usize>,
}

#[axum::debug_handler]
async fn list_monitors(
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<TagQuery>,
) -> Result<Json<Vec<Monitor>>, AppError> {
    let monitors =
        monitor_service::list_monitors(app_state.pool.clone(), query.tag.as_deref()).await?;
    Ok(Json(monitors))
}

#[axum::debug_handler]
async fn create_monitor(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<CreateMonitor>,
) -> Result<(StatusCode, Json<Monitor>), AppError> {
    let created = monitor_service::create_monitor(app_state.pool.clone(), payload).await?;
    if created.enabled {
        app_state.scheduler.reschedule(&created.id).await;
    }
    Ok((StatusCode::CREATED, Json(created)))
}

#[axum::debug_handler]
async fn get_monitor(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Monitor>, AppError> {
    let monitor = monitor_service::get_monitor(app_state.pool.clone(), &id)
        .await?
        .ok_or_else(|| AppError::NotFound("Monitor not found".to_string()))?;
    Ok(Json(monitor))
}

#[axum::debug_handler]
async fn update_monitor(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateMonitor>,
) -> Result<Json<Monitor>, AppError> {
    let (updated, trigger_changed) =
        monitor_service::update_monitor(app_state.pool.clone(), &id, payload)
            .await?
            .ok_or_else(|| AppError::NotFound("Monitor not found".to_string()))?;

    // Cosmetic updates (name, tags) leave the scheduler alone.
    if trigger_changed {
        app_state.scheduler.reschedule(&updated.id).await;
    }
    Ok(Json(updated))
}

#[axum::debug_handler]
async fn delete_monitor(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let deleted = monitor_service::delete_monitor(app_state.pool.clone(), &id).await?;
    if !deleted {
        return Err(AppError::NotFound("Monitor not found".to_string()));
    }
    app_state.scheduler.unschedule(&id).await;
    Ok(StatusCode::NO_CONTENT)
}

/// Ad-hoc run: bypasses the scheduler entirely and does not shift the next
/// scheduled tick.
#[axum::debug_handler]
async fn run_check(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CheckResultRecord>, AppError> {
    let monitor = monitor_service::get_monitor(app_state.pool.clone(), &id)
        .await?
        .ok_or_else(|| AppError::NotFound("Monitor not found".to_string()))?;

    let result = pipeline::run_check(
        app_state.pool.clone(),
        &monitor,
        app_state.config.results_retention,
        false,
    )
    .await?;
    Ok(Json(result))
}

/// Check every enabled monitor (optionally tag-filtered); concurrency is
/// bounded by the same worker-pool limit the scheduler uses.
#[axum::debug_handler]
async fn check_all(
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<TagQuery>,
) -> Result<Json<Vec<CheckResultRecord>>, AppError> {
    let monitors =
        monitor_service::list_monitors(app_state.pool.clone(), query.tag.as_deref()).await?;

    let results: Vec<CheckResultRecord> = futures_util::stream::iter(
        monitors.into_iter().filter(|m| m.enabled).map(|monitor| {
            let pool = app_state.pool.clone();
            let retention = app_state.config.results_retention;
            async move {
                match pipeline::run_check(pool, &monitor, retention, false).await {
                    Ok(result) => Some(result),
                    Err(e) => {
                        error!(monitor_id = %monitor.id, error = %e, "check-all run failed.");
                        None
                    }
                }
            }
        }),
    )
    .buffer_unordered(app_state.config.worker_concurrency.max(1))
    .filter_map(|r| async move { r })
    .collect()
    .await;

    Ok(Json(results))
}

#[axum::debug_handler]
async fn get_results(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ResultsQuery>,
) -> Result<Json<Vec<CheckResultRecord>>, AppError> {
    monitor_service::get_monitor(app_state.pool.clone(), &id)
        .await?
        .ok_or_else(|| AppError::NotFound("Monitor not found".to_string()))?;

    let results =
        result_service::list_results(app_state.pool.clone(), &id, query.limit.unwrap_or(100))
            .await?;
    Ok(Json(results))
}

#[axum::debug_handler]
async fn list_tags(
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<Vec<String>>, AppError> {
    let tags = monitor_service::list_tags(app_state.pool.clone()).await?;
    Ok(Json(tags))
}
