//! jq extractor: applies a jq-style program to the JSON response body and
//! stores the single resulting value.
//!
//! The evaluator covers the path/pipe subset used by monitor pipelines:
//! `.key`, `.key.nested`, `.[0]`, `.key[0]`, `.["quoted key"]`, and pipes to
//! `length`, `keys`, `type`, `first`, and `last`.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::stages::registry::{OptionMeta, StageDescriptor};
use crate::stages::{CheckContext, Stage, StageError, StageResult, StageSpec};

pub static DESCRIPTOR: StageDescriptor = StageDescriptor {
    type_name: "jq",
    display_name: "jq",
    description: "Extract values from JSON using jq expressions",
    is_network_stage: false,
    options: &[
        OptionMeta {
            name: "expr",
            label: "Expression",
            kind: "string",
            required: true,
            default: None,
            description: "jq expression",
            placeholder: ".data | length",
        },
        OptionMeta {
            name: "store_as",
            label: "Store As",
            kind: "string",
            required: false,
            default: None,
            description: "Key to store extracted value",
            placeholder: "length",
        },
    ],
    build: JqStage::from_spec,
};

pub struct JqStage {
    expr: String,
    store_as: Option<String>,
}

impl JqStage {
    pub fn from_spec(spec: &StageSpec) -> Result<Box<dyn Stage>, StageError> {
        spec.warn_unknown_options(&["type", "expr", "store_as"]);
        Ok(Box::new(JqStage {
            expr: spec.require_str("expr")?,
            store_as: spec.opt_str("store_as").map(str::to_string),
        }))
    }
}

#[async_trait]
impl Stage for JqStage {
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

        let value = match eval(&data, &self.expr) {
            Ok(value) => value,
            Err(e) => {
                return StageResult::down("extraction_failed")
                    .with_detail("expression", self.expr.clone())
                    .with_detail("error", e);
            }
        };

        if let Some(store_as) = &self.store_as {
            ctx.values.insert(store_as.clone(), value.clone());
        }

        StageResult::up(format!("extracted: {value}"))
            .with_detail("expression", self.expr.clone())
            .with_detail("value", value.clone())
            .with_detail("type", json_type_name(&value))
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Evaluate the supported jq subset, producing exactly one value.
fn eval(data: &Value, expr: &str) -> Result<Value, String> {
    let expr = expr.trim();
    if expr.is_empty() || expr == "." {
        return Ok(data.clone());
    }

    let mut parts = expr.split(" | ");
    let path = parts.next().unwrap_or(".");
    let mut current = eval_path(data, path)?;

    for func in parts {
        current = match func.trim() {
            "length" => match &current {
                Value::String(s) => json!(s.len()),
                Value::Array(a) => json!(a.len()),
                Value::Object(o) => json!(o.len()),
                _ => json!(0),
            },
            "keys" => match &current {
                Value::Object(o) => Value::Array(o.keys().map(|k| json!(k)).collect()),
                _ => json!([]),
            },
            "type" => json!(json_type_name(&current)),
            "first" => match &current {
                Value::Array(a) => a.first().cloned().unwrap_or(Value::Null),
                _ => Value::Null,
            },
            "last" => match &current {
                Value::Array(a) => a.last().cloned().unwrap_or(Value::Null),
                _ => Value::Null,
            },
            other => return Err(format!("unsupported function: {other}")),
        };
    }

    Ok(current)
}

fn eval_path(data: &Value, path: &str) -> Result<Value, String> {
    let path = path.trim().strip_prefix('.').unwrap_or(path.trim());
    if path.is_empty() {
        return Ok(data.clone());
    }

    let mut current = data.clone();
    for token in tokenize(path)? {
        current = match token {
            PathToken::Key(key) => current.get(&key).cloned().unwrap_or(Value::Null),
            PathToken::Index(idx) => current.get(idx).cloned().unwrap_or(Value::Null),
        };
        if current.is_null() {
            return Ok(Value::Null);
        }
    }
    Ok(current)
}

enum PathToken {
    Key(String),
    Index(usize),
}

fn tokenize(path: &str) -> Result<Vec<PathToken>, String> {
    let mut tokens = Vec::new();
    let mut rest = path;

    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('.') {
            rest = stripped;
            continue;
        }
        if let Some(stripped) = rest.strip_prefix("[\"") {
            let end = stripped
                .find("\"]")
                .ok_or_else(|| "unterminated quoted key".to_string())?;
            tokens.push(PathToken::Key(stripped[..end].to_string()));
            rest = &stripped[end + 2..];
            continue;
        }
        if let Some(stripped) = rest.strip_prefix('[') {
            let end = stripped
                .find(']')
                .ok_or_else(|| "unterminated index".to_string())?;
            let idx = stripped[..end]
                .parse()
                .map_err(|_| format!("invalid index: {}", &stripped[..end]))?;
            tokens.push(PathToken::Index(idx));
            rest = &stripped[end + 1..];
            continue;
        }
        let end = rest
            .find(|c: char| c == '.' || c == '[')
            .unwrap_or(rest.len());
        if end == 0 {
            return Err(format!("cannot parse expression at: {rest}"));
        }
        tokens.push(PathToken::Key(rest[..end].to_string()));
        rest = &rest[end..];
    }

    Ok(tokens)
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

    fn stage(expr: &str, store_as: Option<&str>) -> Box<dyn Stage> {
        let mut spec = StageSpec::new("jq").with_option("expr", expr);
        if let Some(key) = store_as {
            spec = spec.with_option("store_as", key);
        }
        JqStage::from_spec(&spec).unwrap()
    }

    #[tokio::test]
    async fn extracts_nested_keys() {
        let mut ctx = ctx_with_body(r#"{"data": {"count": 42}}"#);
        let result = stage(".data.count", Some("c")).check("", false, &mut ctx).await;
        assert_eq!(result.status, Status::Up);
        assert_eq!(ctx.values.get("c"), Some(&json!(42)));
    }

    #[tokio::test]
    async fn supports_array_indexing_and_pipes() {
        let mut ctx = ctx_with_body(r#"{"items": [{"name": "a"}, {"name": "b"}]}"#);
        let result = stage(".items[1].name", None).check("", false, &mut ctx).await;
        assert_eq!(result.details.get("value"), Some(&json!("b")));

        let mut ctx = ctx_with_body(r#"{"items": [1, 2, 3]}"#);
        let result = stage(".items | length", None).check("", false, &mut ctx).await;
        assert_eq!(result.details.get("value"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn quoted_keys_work() {
        let mut ctx = ctx_with_body(r#"{"odd key": 1}"#);
        let result = stage(r#".["odd key"]"#, None).check("", false, &mut ctx).await;
        assert_eq!(result.details.get("value"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn non_json_body_is_down() {
        let mut ctx = ctx_with_body("<html>");
        let result = stage(".count", None).check("", false, &mut ctx).await;
        assert_eq!(result.status, Status::Down);
        assert_eq!(result.message, "invalid_json");
    }

    #[tokio::test]
    async fn missing_body_is_down() {
        let mut ctx = CheckContext::new();
        let result = stage(".count", None).check("", false, &mut ctx).await;
        assert_eq!(result.status, Status::Down);
    }

    #[test]
    fn expr_is_required() {
        assert!(JqStage::from_spec(&StageSpec::new("jq")).is_err());
    }
}
