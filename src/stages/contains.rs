//! Contains assertion: substring test on the response body, optionally
//! negated.

use async_trait::async_trait;

use crate::stages::registry::{OptionMeta, StageDescriptor};
use crate::stages::{CheckContext, Stage, StageError, StageResult, StageSpec};

pub static DESCRIPTOR: StageDescriptor = StageDescriptor {
    type_name: "contains",
    display_name: "Contains",
    description: "Check if response contains/excludes text",
    is_network_stage: false,
    options: &[
        OptionMeta {
            name: "pattern",
            label: "Pattern",
            kind: "string",
            required: true,
            default: None,
            description: "Text to search for",
            placeholder: "success",
        },
        OptionMeta {
            name: "negate",
            label: "Negate",
            kind: "boolean",
            required: false,
            default: Some("false"),
            description: "Fail if the text IS present (expect absence)",
            placeholder: "",
        },
    ],
    build: ContainsStage::from_spec,
};

pub struct ContainsStage {
    pattern: String,
    negate: bool,
}

impl ContainsStage {
    pub fn from_spec(spec: &StageSpec) -> Result<Box<dyn Stage>, StageError> {
        spec.warn_unknown_options(&["type", "pattern", "negate"]);
        let pattern = spec.require_str("pattern")?;
        if pattern.is_empty() {
            return Err(StageError::BadConfig(
                "contains: `pattern` must not be empty".to_string(),
            ));
        }
        Ok(Box::new(ContainsStage {
            pattern,
            negate: spec.opt_bool("negate").unwrap_or(false),
        }))
    }
}

#[async_trait]
impl Stage for ContainsStage {
    fn descriptor(&self) -> &'static StageDescriptor {
        &DESCRIPTOR
    }

    async fn check(&self, _url: &str, _verbose: bool, ctx: &mut CheckContext) -> StageResult {
        let Some(body) = ctx.response_body.as_deref() else {
            return StageResult::down("no_response_body")
                .with_detail("error", "no response body to check");
        };

        let found = body.contains(&self.pattern);
        let ok = found != self.negate;

        let message = match (ok, self.negate) {
            (true, false) => format!("found: {}", self.pattern),
            (true, true) => format!("absent: {}", self.pattern),
            (false, false) => format!("not found: {}", self.pattern),
            (false, true) => format!("unexpectedly present: {}", self.pattern),
        };

        let result = if ok {
            StageResult::up(message)
        } else {
            StageResult::down(message)
        };
        result
            .with_detail("pattern", self.pattern.clone())
            .with_detail("negate", self.negate)
            .with_detail("found", found)
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

    fn stage(pattern: &str, negate: bool) -> Box<dyn Stage> {
        let spec = StageSpec::new("contains")
            .with_option("pattern", pattern)
            .with_option("negate", negate);
        ContainsStage::from_spec(&spec).unwrap()
    }

    #[tokio::test]
    async fn present_substring_is_up() {
        let mut ctx = ctx_with_body("all systems operational");
        let result = stage("operational", false).check("", false, &mut ctx).await;
        assert_eq!(result.status, Status::Up);
    }

    #[tokio::test]
    async fn missing_substring_is_down() {
        let mut ctx = ctx_with_body("maintenance mode");
        let result = stage("operational", false).check("", false, &mut ctx).await;
        assert_eq!(result.status, Status::Down);
    }

    #[tokio::test]
    async fn negate_inverts_the_verdict() {
        let mut ctx = ctx_with_body("error: disk full");
        let result = stage("error", true).check("", false, &mut ctx).await;
        assert_eq!(result.status, Status::Down);

        let mut ctx = ctx_with_body("all good");
        let result = stage("error", true).check("", false, &mut ctx).await;
        assert_eq!(result.status, Status::Up);
    }

    #[test]
    fn empty_pattern_is_rejected() {
        let spec = StageSpec::new("contains").with_option("pattern", "");
        assert!(ContainsStage::from_spec(&spec).is_err());
    }
}
