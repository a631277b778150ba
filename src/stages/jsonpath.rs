//! JSONPath extractor.
//!
//! Supports the subset seen in monitor pipelines: `$`, `.key`, `..key`
//! (recursive descent), `[n]`, `[*]`, and `[start:end]` slices. A single
//! match stores the value itself, multiple matches store an array, and zero
//! matches fail the stage.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::stages::registry::{OptionMeta, StageDescriptor};
use crate::stages::{CheckContext, Stage, StageError, StageResult, StageSpec};

const MAX_REPORTED_MATCHES: usize = 10;

pub static DESCRIPTOR: StageDescriptor = StageDescriptor {
    type_name: "jsonpath",
    display_name: "JSONPath",
    description: "Extract values using JSONPath expressions",
    is_network_stage: false,
    options: &[
        OptionMeta {
            name: "expr",
            label: "Expression",
            kind: "string",
            required: true,
            default: None,
            description: "JSONPath expression",
            placeholder: "$.data.count",
        },
        OptionMeta {
            name: "store_as",
            label: "Store As",
            kind: "string",
            required: false,
            default: None,
            description: "Key to store extracted value for later stages",
            placeholder: "count",
        },
    ],
    build: JsonPathStage::from_spec,
};

pub struct JsonPathStage {
    expr: String,
    store_as: Option<String>,
}

impl JsonPathStage {
    pub fn from_spec(spec: &StageSpec) -> Result<Box<dyn Stage>, StageError> {
        spec.warn_unknown_options(&["type", "expr", "store_as"]);
        let expr = spec.require_str("expr")?;
        if !expr.starts_with('$') {
            return Err(StageError::BadConfig(format!(
                "jsonpath: expression must start with `$`, got {expr}"
            )));
        }
        Ok(Box::new(JsonPathStage {
            expr,
            store_as: spec.opt_str("store_as").map(str::to_string),
        }))
    }
}

#[async_trait]
impl Stage for JsonPathStage {
    fn descriptor(&self) -> &'static StageDescriptor {
        &DESCRIPTOR
    }

    async fn check(&self, _url: &str, _verbose: bool, ctx: &mut CheckContext) -> StageResult {
        let Some(body) = ctx.response_body.as_deref() else {
            return StageResult::down("no_response_body")
                .with_detail("error", "no response body to extract from");
        };

        let data: Value = match serde_json::from_str(body) {
            Ok(data) => data,
            Err(e) => {
                return StageResult::down("invalid_json").with_detail("error", e.to_string());
            }
        };

        let matches = extract(&data, &self.expr[1..]);
        if matches.is_empty() {
            return StageResult::down("no_matches")
                .with_detail("expression", self.expr.clone())
                .with_detail("matches", json!([]));
        }

        let value = if matches.len() == 1 {
            matches[0].clone()
        } else {
            Value::Array(matches.clone())
        };
        if let Some(store_as) = &self.store_as {
            ctx.values.insert(store_as.clone(), value.clone());
        }

        let reported: Vec<Value> = matches.iter().take(MAX_REPORTED_MATCHES).cloned().collect();
        StageResult::up(format!("extracted: {value}"))
            .with_detail("expression", self.expr.clone())
            .with_detail("value", value)
            .with_detail("match_count", matches.len())
            .with_detail("matches", Value::Array(reported))
    }
}

fn extract(current: &Value, path: &str) -> Vec<Value> {
    if path.is_empty() {
        return vec![current.clone()];
    }

    // Recursive descent: `..key`
    if let Some(rest) = path.strip_prefix("..") {
        let (key, tail) = split_key(rest);
        if key.is_empty() {
            return Vec::new();
        }
        let mut found = Vec::new();
        descend(current, key, tail, &mut found);
        return found;
    }

    if let Some(rest) = path.strip_prefix('.') {
        return extract(current, rest);
    }

    if let Some(rest) = path.strip_prefix('[') {
        let Some(end) = rest.find(']') else {
            return Vec::new();
        };
        let selector = &rest[..end];
        let tail = &rest[end + 1..];
        let Value::Array(items) = current else {
            return Vec::new();
        };

        if selector == "*" {
            return items.iter().flat_map(|item| extract(item, tail)).collect();
        }
        if let Some((start, stop)) = selector.split_once(':') {
            let start = start.parse().unwrap_or(0);
            let stop = stop.parse().unwrap_or(items.len()).min(items.len());
            return items
                .iter()
                .skip(start)
                .take(stop.saturating_sub(start))
                .flat_map(|item| extract(item, tail))
                .collect();
        }
        if let Ok(idx) = selector.parse::<usize>() {
            if let Some(item) = items.get(idx) {
                return extract(item, tail);
            }
        }
        return Vec::new();
    }

    let (key, tail) = split_key(path);
    match current.get(key) {
        Some(child) => extract(child, tail),
        None => Vec::new(),
    }
}

fn descend<'a>(current: &Value, key: &'a str, tail: &'a str, found: &mut Vec<Value>) {
    match current {
        Value::Object(map) => {
            if let Some(child) = map.get(key) {
                found.extend(extract(child, tail));
            }
            for child in map.values() {
                descend(child, key, tail, found);
            }
        }
        Value::Array(items) => {
            for item in items {
                descend(item, key, tail, found);
            }
        }
        _ => {}
    }
}

fn split_key(path: &str) -> (&str, &str) {
    let end = path
        .find(|c: char| c == '.' || c == '[')
        .unwrap_or(path.len());
    (&path[..end], &path[end..])
}
