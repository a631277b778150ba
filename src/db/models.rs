//! Monitor, check-result, and scheduler-job records plus the create/update
//! payloads and their validation.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::scheduler::trigger::Trigger;
use crate::stages::{registry, Status, StageSpec};
use crate::web::error::AppError;

/// Timestamps carry millisecond precision; anything finer would not survive
/// the storage round-trip anyway.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    Utc.timestamp_millis_opt(now.timestamp_millis())
        .single()
        .unwrap_or(now)
}

pub const MAX_URL_LEN: usize = 2048;
pub const MIN_INTERVAL_SECS: u32 = 10;
pub const MAX_NAME_LEN: usize = 100;
pub const DEFAULT_INTERVAL_SECS: u32 = 30;

/// Durable monitor configuration: a target URL bound to a stage pipeline and
/// a cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Monitor {
    pub id: String,
    pub name: String,
    pub url: String,
    pub pipeline: Vec<StageSpec>,
    pub interval: u32,
    pub schedule: Option<String>,
    pub enabled: bool,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<Status>,
}

/// Durable outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResultRecord {
    pub id: String,
    pub monitor_id: String,
    pub status: Status,
    pub message: String,
    pub elapsed_ms: f64,
    pub details: Value,
    pub checked_at: DateTime<Utc>,
}

/// Persisted scheduler job state; opaque to everything but the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerJobRecord {
    pub monitor_id: String,
    pub trigger_kind: String,
    pub trigger_spec: String,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

fn default_interval() -> u32 {
    DEFAULT_INTERVAL_SECS
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateMonitor {
    pub name: String,
    pub url: String,
    pub pipeline: Vec<StageSpec>,
    #[serde(default = "default_interval")]
    pub interval: u32,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// All fields optional; absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateMonitor {
    pub name: Option<String>,
    pub url: Option<String>,
    pub pipeline: Option<Vec<StageSpec>>,
    pub interval: Option<u32>,
    /// `Some(None)` clears the cron schedule, falling back to the interval.
    #[serde(default, with = "double_option")]
    pub schedule: Option<Option<String>>,
    pub enabled: Option<bool>,
    pub tags: Option<Vec<String>>,
}

/// Distinguishes "field absent" from "field explicitly null" for `schedule`.
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(de).map(Some)
    }
}

pub fn validate_name(name: &str) -> Result<String, AppError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(AppError::InvalidInput(
            "name must not be empty".to_string(),
        ));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(AppError::InvalidInput(format!(
            "name must be at most {MAX_NAME_LEN} characters"
        )));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(AppError::InvalidInput(
            "name must contain only printable characters".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}

/// Normalize and bound the target URL; bare hosts get an https scheme.
pub fn validate_url(url: &str) -> Result<String, AppError> {
    let normalized = crate::stages::normalize_url(url.trim());
    if normalized.len() > MAX_URL_LEN {
        return Err(AppError::InvalidInput(format!(
            "url must be at most {MAX_URL_LEN} characters"
        )));
    }
    url::Url::parse(&normalized)
        .map_err(|e| AppError::InvalidInput(format!("invalid url: {e}")))?;
    Ok(normalized)
}

pub fn validate_interval(interval: u32) -> Result<(), AppError> {
    if interval < MIN_INTERVAL_SECS {
        return Err(AppError::InvalidInput(format!(
            "interval must be at least {MIN_INTERVAL_SECS} seconds"
        )));
    }
    Ok(())
}

pub fn validate_schedule(schedule: &str) -> Result<(), AppError> {
    Trigger::parse_cron(schedule)
        .map(|_| ())
        .map_err(|e| AppError::InvalidInput(e))
}

/// Every stage type must resolve, every stage config must construct, and at
/// least one stage must be a network stage.
pub fn validate_pipeline(pipeline: &[StageSpec]) -> Result<(), AppError> {
    if pipeline.is_empty() {
        return Err(AppError::InvalidInput(
            "pipeline must contain at least one stage".to_string(),
        ));
    }

    let mut has_network_stage = false;
    for (index, spec) in pipeline.iter().enumerate() {
        let descriptor = registry::get_stage(&spec.stage_type)
            .map_err(|e| AppError::InvalidInput(format!("stage {index}: {e}")))?;
        (descriptor.build)(spec)
            .map_err(|e| AppError::InvalidInput(format!("stage {index}: {e}")))?;
        has_network_stage |= descriptor.is_network_stage;
    }

    if !has_network_stage {
        return Err(AppError::InvalidInput(
            "pipeline must contain at least one network stage".to_string(),
        ));
    }
    Ok(())
}

/// Deduplicate tags preserving first occurrence.
pub fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tags.into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_boundary_is_ten_seconds() {
        assert!(validate_interval(10).is_ok());
        assert!(validate_interval(9).is_err());
    }

    #[test]
    fn url_boundary_is_2048_chars() {
        let base = "https://example.com/";
        let ok = format!("{base}{}", "a".repeat(MAX_URL_LEN - base.len()));
        assert!(validate_url(&ok).is_ok());
        let too_long = format!("{base}{}", "a".repeat(MAX_URL_LEN - base.len() + 1));
        assert!(validate_url(&too_long).is_err());
    }

    #[test]
    fn url_scheme_defaults_to_https() {
        assert_eq!(validate_url("example.com").unwrap(), "https://example.com");
    }

    #[test]
    fn empty_pipeline_is_rejected() {
        assert!(validate_pipeline(&[]).is_err());
    }

    #[test]
    fn extractor_only_pipeline_is_rejected() {
        let pipeline = vec![StageSpec::new("jq").with_option("expr", ".count")];
        let err = validate_pipeline(&pipeline).unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[test]
    fn unknown_stage_type_is_rejected() {
        let pipeline = vec![StageSpec::new("teleport")];
        assert!(validate_pipeline(&pipeline).is_err());
    }

    #[test]
    fn http_pipeline_validates() {
        let pipeline = vec![
            StageSpec::new("http"),
            StageSpec::new("jq").with_option("expr", ".count").with_option("store_as", "c"),
            StageSpec::new("threshold")
                .with_option("value", "$c")
                .with_option("min", 1),
        ];
        assert!(validate_pipeline(&pipeline).is_ok());
    }

    #[test]
    fn five_field_cron_is_accepted_three_field_rejected() {
        assert!(validate_schedule("*/5 * * * *").is_ok());
        assert!(validate_schedule("*/5 * *").is_err());
    }

    #[test]
    fn tags_deduplicate_preserving_order() {
        let tags = vec![
            "prod".to_string(),
            "eu".to_string(),
            "prod".to_string(),
            " ".to_string(),
        ];
        assert_eq!(normalize_tags(tags), vec!["prod", "eu"]);
    }

    #[test]
    fn name_bounds_are_enforced() {
        assert!(validate_name("g").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(&"x".repeat(101)).is_err());
        assert!(validate_name("bad\u{0007}name").is_err());
    }

    #[test]
    fn update_schedule_distinguishes_absent_from_null() {
        let patch: UpdateMonitor = serde_json::from_str(r#"{"name": "n"}"#).unwrap();
        assert!(patch.schedule.is_none());
        let patch: UpdateMonitor = serde_json::from_str(r#"{"schedule": null}"#).unwrap();
        assert_eq!(patch.schedule, Some(None));
        let patch: UpdateMonitor =
            serde_json::from_str(r#"{"schedule": "*/5 * * * *"}"#).unwrap();
        assert_eq!(patch.schedule, Some(Some("*/5 * * * *".to_string())));
    }
}
