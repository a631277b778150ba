use std::sync::Arc;

use axum::{routing::get, Json, Router};
use serde::Serialize;
use serde_json::Value;

use crate::stages::registry;
use crate::web::AppState;

pub fn create_stage_router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(list_stages))
}

#[derive(Serialize)]
struct StageOptionInfo {
    name: &'static str,
    label: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    required: bool,
    default: Value,
    description: &'static str,
    placeholder: &'static str,
}

#[derive(Serialize)]
struct StageInfo {
    #[serde(rename = "type")]
    type_name: &'static str,
    name: &'static str,
    description: &'static str,
    is_network_stage: bool,
    options: Vec<StageOptionInfo>,
}

/// Stage catalog: everything a client needs to render a pipeline editor.
#[axum::debug_handler]
async fn list_stages() -> Json<Vec<StageInfo>> {
    let stages = registry::registry()
        .into_iter()
        .map(|descriptor| StageInfo {
            type_name: descriptor.type_name,
            name: descriptor.display_name,
            description: descriptor.description,
            is_network_stage: descriptor.is_network_stage,
            options: descriptor
                .options
                .iter()
                .map(|opt| StageOptionInfo {
                    name: opt.name,
                    label: opt.label,
                    kind: opt.kind,
                    required: opt.required,
                    default: opt.default_value(),
                    description: opt.description,
                    placeholder: opt.placeholder,
                })
                .collect(),
        })
        .collect();
    Json(stages)
}
