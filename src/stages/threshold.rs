//! Threshold assertion: resolves a value (literal or `$ref`) and checks it
//! against min/max bounds.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::stages::registry::{OptionMeta, StageDescriptor};
use crate::stages::{value, CheckContext, Stage, StageError, StageResult, StageSpec};

pub static DESCRIPTOR: StageDescriptor = StageDescriptor {
    type_name: "threshold",
    display_name: "Threshold",
    description: "Assert value is within threshold bounds",
    is_network_stage: false,
    options: &[
        OptionMeta {
            name: "value",
            label: "Value Reference",
            kind: "string",
            required: true,
            default: Some("\"$elapsed_ms\""),
            description: "Value to check ($elapsed_ms, $status_code, or stored key)",
            placeholder: "$elapsed_ms",
        },
        OptionMeta {
            name: "min",
            label: "Minimum",
            kind: "number",
            required: false,
            default: None,
            description: "Minimum allowed value (inclusive)",
            placeholder: "",
        },
        OptionMeta {
            name: "max",
            label: "Maximum",
            kind: "number",
            required: false,
            default: None,
            description: "Maximum allowed value (inclusive)",
            placeholder: "1000",
        },
    ],
    build: ThresholdStage::from_spec,
};

pub struct ThresholdStage {
    value_ref: Value,
    min: Option<f64>,
    max: Option<f64>,
}

impl ThresholdStage {
    pub fn from_spec(spec: &StageSpec) -> Result<Box<dyn Stage>, StageError> {
        spec.warn_unknown_options(&["type", "value", "min", "max"]);

        let value_ref = spec
            .options
            .get("value")
            .cloned()
            .ok_or_else(|| {
                StageError::BadConfig("threshold: missing required option `value`".to_string())
            })?;
        let min = spec.opt_f64("min");
        let max = spec.opt_f64("max");
        if min.is_none() && max.is_none() {
            return Err(StageError::BadConfig(
                "threshold: at least one of `min`/`max` is required".to_string(),
            ));
        }
        if let (Some(min), Some(max)) = (min, max) {
            if min > max {
                return Err(StageError::BadConfig(format!(
                    "threshold: `min` ({min}) exceeds `max` ({max})"
                )));
            }
        }

        Ok(Box::new(ThresholdStage { value_ref, min, max }))
    }
}

#[async_trait]
impl Stage for ThresholdStage {
    fn descriptor(&self) -> &'static StageDescriptor {
        &DESCRIPTOR
    }

    async fn check(&self, _url: &str, _verbose: bool, ctx: &mut CheckContext) -> StageResult {
        let resolved = match value::resolve_number(&self.value_ref, ctx) {
            Ok(resolved) => resolved,
            Err(unresolved) => {
                return StageResult::down(unresolved.message())
                    .with_detail("value_ref", self.value_ref.clone());
            }
        };
        let v = match resolved {
            Ok(v) => v,
            Err(raw) => {
                return StageResult::down("not_a_number")
                    .with_detail("value_ref", self.value_ref.clone())
                    .with_detail("value", raw);
            }
        };

        let details = json!({
            "value_ref": self.value_ref,
            "value": v,
            "min": self.min,
            "max": self.max,
        });
        let details = details.as_object().cloned().unwrap_or_default();

        let below = self.min.is_some_and(|min| v < min);
        let above = self.max.is_some_and(|max| v > max);
        let mut result = if below || above {
            StageResult::down("out_of_range")
        } else {
            StageResult::up(match (self.min, self.max) {
                (Some(min), Some(max)) => format!("{min} <= {v} <= {max}"),
                (Some(min), None) => format!("{v} >= {min}"),
                (None, Some(max)) => format!("{v} <= {max}"),
                (None, None) => format!("value={v}"),
            })
        };
        result.details = details;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::Status;

    fn stage(value: Value, min: Option<f64>, max: Option<f64>) -> Box<dyn Stage> {
        let mut spec = StageSpec::new("threshold").with_option("value", value);
        if let Some(min) = min {
            spec = spec.with_option("min", min);
        }
        if let Some(max) = max {
            spec = spec.with_option("max", max);
        }
        ThresholdStage::from_spec(&spec).unwrap()
    }

    #[tokio::test]
    async fn value_within_bounds_is_up() {
        let mut ctx = CheckContext::new();
        ctx.values.insert("c".to_string(), json!(42));
        let result = stage(json!("$c"), Some(10.0), Some(100.0))
            .check("", false, &mut ctx)
            .await;
        assert_eq!(result.status, Status::Up);
    }

    #[tokio::test]
    async fn out_of_range_is_down_with_canonical_message() {
        let mut ctx = CheckContext::new();
        ctx.values.insert("c".to_string(), json!(42));
        let result = stage(json!("$c"), Some(100.0), None).check("", false, &mut ctx).await;
        assert_eq!(result.status, Status::Down);
        assert_eq!(result.message, "out_of_range");
    }

    #[tokio::test]
    async fn bounds_are_inclusive() {
        let mut ctx = CheckContext::new();
        let result = stage(json!(10), Some(10.0), Some(10.0)).check("", false, &mut ctx).await;
        assert_eq!(result.status, Status::Up);
    }

    #[tokio::test]
    async fn unresolved_reference_is_down() {
        let mut ctx = CheckContext::new();
        let result = stage(json!("$missing"), None, Some(1.0)).check("", false, &mut ctx).await;
        assert_eq!(result.status, Status::Down);
        assert_eq!(result.message, "unresolved $missing");
    }

    #[tokio::test]
    async fn non_numeric_value_is_down() {
        let mut ctx = CheckContext::new();
        ctx.values.insert("v".to_string(), json!({"nested": true}));
        let result = stage(json!("$v"), None, Some(1.0)).check("", false, &mut ctx).await;
        assert_eq!(result.status, Status::Down);
        assert_eq!(result.message, "not_a_number");
    }

    #[test]
    fn requires_at_least_one_bound() {
        let spec = StageSpec::new("threshold").with_option("value", "$elapsed_ms");
        assert!(matches!(
            ThresholdStage::from_spec(&spec),
            Err(StageError::BadConfig(_))
        ));
    }

    #[test]
    fn rejects_inverted_bounds() {
        let spec = StageSpec::new("threshold")
            .with_option("value", "$x")
            .with_option("min", 10)
            .with_option("max", 5);
        assert!(ThresholdStage::from_spec(&spec).is_err());
    }
}
