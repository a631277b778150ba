//! Regex extractor: captures a value out of the textual response body.

use async_trait::async_trait;
use serde_json::json;

use crate::stages::registry::{OptionMeta, StageDescriptor};
use crate::stages::{CheckContext, Stage, StageError, StageResult, StageSpec};

pub static DESCRIPTOR: StageDescriptor = StageDescriptor {
    type_name: "regex",
    display_name: "Regex",
    description: "Extract values using regex capture groups",
    is_network_stage: false,
    options: &[
        OptionMeta {
            name: "pattern",
            label: "Pattern",
            kind: "string",
            required: true,
            default: None,
            description: "Regular expression pattern",
            placeholder: "version: (\\d+\\.\\d+)",
        },
        OptionMeta {
            name: "store_as",
            label: "Store As",
            kind: "string",
            required: false,
            default: None,
            description: "Key to store the first capture group (or whole match)",
            placeholder: "version",
        },
    ],
    build: RegexStage::from_spec,
};

pub struct RegexStage {
    pattern: regex::Regex,
    store_as: Option<String>,
}

impl RegexStage {
    pub fn from_spec(spec: &StageSpec) -> Result<Box<dyn Stage>, StageError> {
        spec.warn_unknown_options(&["type", "pattern", "store_as"]);
        let raw = spec.require_str("pattern")?;
        let pattern = regex::Regex::new(&raw)
            .map_err(|e| StageError::BadConfig(format!("regex: invalid pattern: {e}")))?;
        Ok(Box::new(RegexStage {
            pattern,
            store_as: spec.opt_str("store_as").map(str::to_string),
        }))
    }
}

#[async_trait]
impl Stage for RegexStage {
    fn descriptor(&self) -> &'static StageDescriptor {
        &DESCRIPTOR
    }

    async fn check(&self, _url: &str, _verbose: bool, ctx: &mut CheckContext) -> StageResult {
        let Some(body) = ctx.response_body.as_deref() else {
            return StageResult::down("no_response_body")
                .with_detail("error", "no response body to extract from");
        };

        let Some(captures) = self.pattern.captures(body) else {
            return StageResult::down("no_match")
                .with_detail("pattern", self.pattern.as_str());
        };

        // Group 1 when the pattern captures, the whole match otherwise.
        let whole = captures.get(0).map(|m| m.as_str()).unwrap_or_default();
        let extracted = captures
            .get(1)
            .map(|m| m.as_str())
            .unwrap_or(whole)
            .to_string();

        if let Some(store_as) = &self.store_as {
            ctx.values
                .insert(store_as.clone(), json!(extracted.clone()));
        }

        let groups: Vec<Option<&str>> = captures
            .iter()
            .skip(1)
            .map(|g| g.map(|m| m.as_str()))
            .collect();

        StageResult::up(format!("extracted: {extracted}"))
            .with_detail("pattern", self.pattern.as_str())
            .with_detail("match", whole)
            .with_detail("groups", json!(groups))
            .with_detail("value", extracted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::Status;

    fn ctx_with_body(body: &str) -> CheckContext {
        let mut ctx = CheckContext::new();
        ctx.response_body = Some(body.to_string());
        ctx
    }

    fn stage(pattern: &str, store_as: Option<&str>) -> Box<dyn Stage> {
        let mut spec = StageSpec::new("regex").with_option("pattern", pattern);
        if let Some(key) = store_as {
            spec = spec.with_option("store_as", key);
        }
        RegexStage::from_spec(&spec).unwrap()
    }

    #[tokio::test]
    async fn first_group_is_extracted() {
        let mut ctx = ctx_with_body("version: 3.14 build 7");
        let result = stage(r"version: (\d+\.\d+)", Some("v"))
            .check("", false, &mut ctx)
            .await;
        assert_eq!(result.status, Status::Up);
        assert_eq!(ctx.values.get("v"), Some(&json!("3.14")));
    }

    #[tokio::test]
    async fn groupless_pattern_takes_whole_match() {
        let mut ctx = ctx_with_body("status=ok;");
        let result = stage(r"status=\w+", Some("s")).check("", false, &mut ctx).await;
        assert_eq!(ctx.values.get("s"), Some(&json!("status=ok")));
        assert_eq!(result.status, Status::Up);
    }

    #[tokio::test]
    async fn no_match_is_down() {
        let mut ctx = ctx_with_body("nothing here");
        let result = stage(r"version: (\d+)", None).check("", false, &mut ctx).await;
        assert_eq!(result.status, Status::Down);
        assert_eq!(result.message, "no_match");
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let spec = StageSpec::new("regex").with_option("pattern", "([unclosed");
        assert!(matches!(
            RegexStage::from_spec(&spec),
            Err(StageError::BadConfig(_))
        ));
    }
}
