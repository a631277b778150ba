//! Age assertion: checks that a referenced timestamp is fresh enough.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use crate::stages::registry::{OptionMeta, StageDescriptor};
use crate::stages::{value, CheckContext, Stage, StageError, StageResult, StageSpec};

const DEFAULT_MAX_AGE_SECS: i64 = 3600;

pub static DESCRIPTOR: StageDescriptor = StageDescriptor {
    type_name: "age",
    display_name: "Age",
    description: "Check data freshness (timestamp age)",
    is_network_stage: false,
    options: &[
        OptionMeta {
            name: "value",
            label: "Value Reference",
            kind: "string",
            required: true,
            default: None,
            description: "Reference to a timestamp value (e.g. $last_updated)",
            placeholder: "$last_updated",
        },
        OptionMeta {
            name: "max_age",
            label: "Max Age",
            kind: "number",
            required: false,
            default: Some("3600"),
            description: "Maximum allowed age in seconds; twice this degrades",
            placeholder: "3600",
        },
    ],
    build: AgeStage::from_spec,
};

pub struct AgeStage {
    value_ref: Value,
    max_age: i64,
}

impl AgeStage {
    pub fn from_spec(spec: &StageSpec) -> Result<Box<dyn Stage>, StageError> {
        spec.warn_unknown_options(&["type", "value", "max_age"]);

        let value_ref = spec.options.get("value").cloned().ok_or_else(|| {
            StageError::BadConfig("age: missing required option `value`".to_string())
        })?;
        let max_age = match spec.opt_f64("max_age") {
            Some(v) if v >= 0.0 => v as i64,
            Some(_) => {
                return Err(StageError::BadConfig(
                    "age: `max_age` must be a non-negative number of seconds".to_string(),
                ))
            }
            None => DEFAULT_MAX_AGE_SECS,
        };

        Ok(Box::new(AgeStage { value_ref, max_age }))
    }
}

#[async_trait]
impl Stage for AgeStage {
    fn descriptor(&self) -> &'static StageDescriptor {
        &DESCRIPTOR
    }

    async fn check(&self, _url: &str, _verbose: bool, ctx: &mut CheckContext) -> StageResult {
        let resolved = match value::resolve(&self.value_ref, ctx) {
            Ok(resolved) => resolved,
            Err(unresolved) => {
                return StageResult::down(unresolved.message())
                    .with_detail("value_ref", self.value_ref.clone());
            }
        };

        let Some(timestamp) = parse_timestamp(&resolved) else {
            return StageResult::down("unparseable_timestamp")
                .with_detail("value_ref", self.value_ref.clone())
                .with_detail("value", resolved);
        };

        let age_secs = (Utc::now() - timestamp).num_seconds();
        let details = |result: StageResult| {
            result
                .with_detail("timestamp", timestamp.to_rfc3339())
                .with_detail("age_seconds", age_secs)
                .with_detail("max_age", self.max_age)
        };

        if age_secs < 0 {
            return details(StageResult::down("timestamp_in_future"));
        }
        if age_secs <= self.max_age {
            details(StageResult::up(format!(
                "age {age_secs}s within {}s",
                self.max_age
            )))
        } else if age_secs <= self.max_age * 2 {
            details(StageResult::degraded(format!(
                "age {age_secs}s exceeds {}s",
                self.max_age
            )))
        } else {
            details(StageResult::down(format!(
                "stale: age {age_secs}s exceeds {}s",
                self.max_age * 2
            )))
        }
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let secs = n.as_f64()?;
            Utc.timestamp_opt(secs as i64, 0).single()
        }
        Value::String(s) => parse_timestamp_str(s),
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::Status;
    use chrono::Duration;
    use serde_json::json;

    fn stage(max_age: i64) -> Box<dyn Stage> {
        let spec = StageSpec::new("age")
            .with_option("value", "$ts")
            .with_option("max_age", max_age);
        AgeStage::from_spec(&spec).unwrap()
    }

    fn ctx_with_ts(ts: DateTime<Utc>) -> CheckContext {
        let mut ctx = CheckContext::new();
        ctx.values.insert("ts".to_string(), json!(ts.to_rfc3339()));
        ctx
    }

    #[tokio::test]
    async fn fresh_timestamp_is_up() {
        let mut ctx = ctx_with_ts(Utc::now() - Duration::seconds(10));
        let result = stage(60).check("", false, &mut ctx).await;
        assert_eq!(result.status, Status::Up);
    }

    #[tokio::test]
    async fn age_within_twice_the_limit_degrades() {
        let mut ctx = ctx_with_ts(Utc::now() - Duration::seconds(90));
        let result = stage(60).check("", false, &mut ctx).await;
        assert_eq!(result.status, Status::Degraded);
    }

    #[tokio::test]
    async fn stale_timestamp_is_down() {
        let mut ctx = ctx_with_ts(Utc::now() - Duration::seconds(300));
        let result = stage(60).check("", false, &mut ctx).await;
        assert_eq!(result.status, Status::Down);
    }

    #[tokio::test]
    async fn future_timestamp_is_down() {
        let mut ctx = ctx_with_ts(Utc::now() + Duration::seconds(120));
        let result = stage(60).check("", false, &mut ctx).await;
        assert_eq!(result.status, Status::Down);
        assert_eq!(result.message, "timestamp_in_future");
    }

    #[tokio::test]
    async fn unix_epoch_numbers_are_accepted() {
        let mut ctx = CheckContext::new();
        let recent = Utc::now().timestamp() - 5;
        ctx.values.insert("ts".to_string(), json!(recent));
        let result = stage(60).check("", false, &mut ctx).await;
        assert_eq!(result.status, Status::Up);
    }

    #[tokio::test]
    async fn garbage_timestamp_is_down() {
        let mut ctx = CheckContext::new();
        ctx.values.insert("ts".to_string(), json!("not a date"));
        let result = stage(60).check("", false, &mut ctx).await;
        assert_eq!(result.status, Status::Down);
        assert_eq!(result.message, "unparseable_timestamp");
    }
}
