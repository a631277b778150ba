//! Header extractor: case-insensitive lookup in the response headers.

use async_trait::async_trait;
use serde_json::json;

use crate::stages::registry::{OptionMeta, StageDescriptor};
use crate::stages::{CheckContext, Stage, StageError, StageResult, StageSpec};

pub static DESCRIPTOR: StageDescriptor = StageDescriptor {
    type_name: "header",
    display_name: "Header",
    description: "Extract a response header",
    is_network_stage: false,
    options: &[
        OptionMeta {
            name: "pattern",
            label: "Header Name",
            kind: "string",
            required: true,
            default: None,
            description: "Header to look up (case-insensitive)",
            placeholder: "content-type",
        },
        OptionMeta {
            name: "store_as",
            label: "Store As",
            kind: "string",
            required: false,
            default: None,
            description: "Key to store the header value",
            placeholder: "ct",
        },
    ],
    build: HeaderStage::from_spec,
};

pub struct HeaderStage {
    header_name: String,
    store_as: Option<String>,
}

impl HeaderStage {
    pub fn from_spec(spec: &StageSpec) -> Result<Box<dyn Stage>, StageError> {
        spec.warn_unknown_options(&["type", "pattern", "store_as"]);
        Ok(Box::new(HeaderStage {
            header_name: spec.require_str("pattern")?,
            store_as: spec.opt_str("store_as").map(str::to_string),
        }))
    }
}

#[async_trait]
impl Stage for HeaderStage {
    fn descriptor(&self) -> &'static StageDescriptor {
        &DESCRIPTOR
    }

    async fn check(&self, _url: &str, _verbose: bool, ctx: &mut CheckContext) -> StageResult {
        let Some(value) = ctx.header(&self.header_name).cloned() else {
            let available: Vec<String> = ctx.response_headers.keys().cloned().collect();
            return StageResult::down(format!("header not found: {}", self.header_name))
                .with_detail("header", self.header_name.clone())
                .with_detail("available_headers", json!(available));
        };

        if let Some(store_as) = &self.store_as {
            ctx.values.insert(store_as.clone(), json!(value.clone()));
        }

        StageResult::up(format!("{}={value}", self.header_name))
            .with_detail("header", self.header_name.clone())
            .with_detail("value", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::Status;

    fn stage(name: &str, store_as: Option<&str>) -> Box<dyn Stage> {
        let mut spec = StageSpec::new("header").with_option("pattern", name);
        if let Some(key) = store_as {
            spec = spec.with_option("store_as", key);
        }
        HeaderStage::from_spec(&spec).unwrap()
    }

    #[tokio::test]
    async fn lookup_is_case_insensitive() {
        let mut ctx = CheckContext::new();
        ctx.response_headers
            .insert("content-type".to_string(), "application/json".to_string());
        let result = stage("Content-Type", Some("ct")).check("", false, &mut ctx).await;
        assert_eq!(result.status, Status::Up);
        assert_eq!(ctx.values.get("ct"), Some(&json!("application/json")));
    }

    #[tokio::test]
    async fn missing_header_is_down() {
        let mut ctx = CheckContext::new();
        let result = stage("x-absent", None).check("", false, &mut ctx).await;
        assert_eq!(result.status, Status::Down);
        assert!(result.details.contains_key("available_headers"));
    }
}
