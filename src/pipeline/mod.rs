//! Pipeline executor: instantiates the stages of a monitor, runs them in
//! order against a shared context, and merges their verdicts into a single
//! check result.

use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::models::{CheckResultRecord, Monitor};
use crate::db::{monitor_service, result_service, DbPool};
use crate::stages::{registry, CheckContext, StageSpec, Status};
use crate::web::error::AppError;

pub const DEFAULT_STAGE_TIMEOUT_SECS: f64 = 30.0;
pub const MAX_NETWORK_TIMEOUT_SECS: f64 = 60.0;
const MAX_MESSAGE_LEN: usize = 1024;

/// Aggregate of one pipeline run, before persistence.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub status: Status,
    pub message: String,
    pub details: serde_json::Map<String, Value>,
}

/// Hard cap for one stage: network stages honor their own `timeout` option
/// (capped at 60 s), everything else gets the 30 s default.
fn stage_cap(spec: &StageSpec, is_network_stage: bool) -> Duration {
    let secs = if is_network_stage {
        match spec.opt_f64("timeout") {
            Some(t) if t > 0.0 => t.min(MAX_NETWORK_TIMEOUT_SECS),
            _ => DEFAULT_STAGE_TIMEOUT_SECS,
        }
    } else {
        DEFAULT_STAGE_TIMEOUT_SECS
    };
    Duration::from_secs_f64(secs)
}

fn invalid(message: &str, error: String) -> PipelineOutcome {
    let mut details = serde_json::Map::new();
    details.insert("error".to_string(), Value::String(error));
    PipelineOutcome {
        status: Status::Down,
        message: message.to_string(),
        details,
    }
}

/// Run all stages of a pipeline and aggregate their results.
///
/// Stage failures are data: every failure mode below the pipeline boundary
/// ends up as a `down` stage result, and a `down` stage short-circuits the
/// stages after it.
pub async fn run_pipeline(url: &str, pipeline: &[StageSpec], verbose: bool) -> PipelineOutcome {
    // Pre-flight: every type must resolve and at least one stage must be a
    // network stage, otherwise the run is rejected wholesale.
    let mut descriptors = Vec::with_capacity(pipeline.len());
    for spec in pipeline {
        match registry::get_stage(&spec.stage_type) {
            Ok(descriptor) => descriptors.push(descriptor),
            Err(e) => return invalid("pipeline_invalid", e.to_string()),
        }
    }
    if pipeline.is_empty() || !descriptors.iter().any(|d| d.is_network_stage) {
        return invalid(
            "pipeline_invalid",
            "pipeline must contain at least one network stage".to_string(),
        );
    }

    // Whole-pipeline budget: the sum of stage caps plus 10% slack.
    let budget: Duration = pipeline
        .iter()
        .zip(&descriptors)
        .map(|(spec, d)| stage_cap(spec, d.is_network_stage))
        .sum::<Duration>()
        .mul_f64(1.1);
    let deadline = Instant::now() + budget;

    // `$elapsed_ms`/`$status_code`/`$response_length` are served straight
    // from the context by the reference resolver, so they are live from the
    // start of the run without occupying the values map.
    let mut ctx = CheckContext::new();

    let mut details = serde_json::Map::new();
    let mut messages: Vec<String> = Vec::new();
    let mut aggregate = Status::Up;

    for (index, (spec, descriptor)) in pipeline.iter().zip(&descriptors).enumerate() {
        if Instant::now() >= deadline {
            warn!(stage = %spec.stage_type, index, "Pipeline budget exhausted.");
            return invalid("pipeline_timeout", format!("exceeded budget of {budget:?}"));
        }

        let result = match (descriptor.build)(spec) {
            Ok(stage) => {
                let cap = stage_cap(spec, descriptor.is_network_stage);
                match tokio::time::timeout(cap, stage.check(url, verbose, &mut ctx)).await {
                    Ok(result) => result,
                    Err(_) => crate::stages::StageResult::down("timeout")
                        .with_detail("timeout_secs", cap.as_secs_f64()),
                }
            }
            // Bad per-stage config at run time is a stage-level failure.
            Err(e) => crate::stages::StageResult::down(e.to_string()),
        };

        messages.push(format!("{}: {}", spec.stage_type, result.message));

        let key = if details.contains_key(&spec.stage_type) {
            format!("{}#{index}", spec.stage_type)
        } else {
            spec.stage_type.clone()
        };
        details.insert(key, Value::Object(result.details));

        aggregate = aggregate.max(result.status);
        debug!(
            stage = %spec.stage_type,
            index,
            status = %result.status,
            elapsed_ms = result.elapsed_ms,
            "Stage finished."
        );

        // A down stage short-circuits everything after it.
        if result.status == Status::Down {
            break;
        }
    }

    if !ctx.values.is_empty() {
        let values: serde_json::Map<String, Value> = ctx.values.into_iter().collect();
        details.insert("_values".to_string(), Value::Object(values));
    }

    PipelineOutcome {
        status: aggregate,
        message: truncate(messages.join("; "), MAX_MESSAGE_LEN),
        details,
    }
}

/// Run a monitor's pipeline and persist the outcome: exactly one
/// `CheckResultRecord` per call, mirror updated afterwards.
pub async fn run_check(
    pool: DbPool,
    monitor: &Monitor,
    retention: usize,
    verbose: bool,
) -> Result<CheckResultRecord, AppError> {
    let started = Instant::now();
    let outcome = run_pipeline(&monitor.url, &monitor.pipeline, verbose).await;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    let record = CheckResultRecord {
        id: Uuid::new_v4().to_string(),
        monitor_id: monitor.id.clone(),
        status: outcome.status,
        message: outcome.message,
        elapsed_ms,
        details: Value::Object(outcome.details),
        checked_at: crate::db::models::now_millis(),
    };

    result_service::append_result(pool.clone(), &record, retention).await?;
    monitor_service::update_monitor_mirror(pool, &monitor.id, record.checked_at, record.status)
        .await?;

    Ok(record)
}

fn truncate(mut message: String, max_len: usize) -> String {
    if message.len() > max_len {
        let mut end = max_len;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}
