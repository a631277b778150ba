use std::sync::Arc;

use axum::{
    http::{HeaderValue, Method},
    routing::get,
    Json, Router,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::db::DbPool;
use crate::scheduler::SchedulerHandle;
use crate::server::config::ServerConfig;

pub mod error;
pub mod routes;

use routes::{monitor_routes, stage_routes};

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub scheduler: SchedulerHandle,
    pub config: Arc<ServerConfig>,
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

pub fn create_axum_router(
    pool: DbPool,
    scheduler: SchedulerHandle,
    config: Arc<ServerConfig>,
) -> Router {
    let app_state = Arc::new(AppState {
        pool,
        scheduler,
        config: config.clone(),
    });

    let allow_origin = if config.cors_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse::<HeaderValue>().ok())
            .collect();
        AllowOrigin::list(origins)
    };
    let cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(vec![
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .nest("/api/monitors", monitor_routes::create_monitor_router())
        .nest("/api/stages", stage_routes::create_stage_router())
        .with_state(app_state)
        .layer(cors)
}
