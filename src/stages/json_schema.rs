//! JSON Schema assertion: validates the JSON response body against a schema
//! subset (type, enum, required, properties, items, numeric and string
//! bounds, pattern).

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::stages::registry::{OptionMeta, StageDescriptor};
use crate::stages::{CheckContext, Stage, StageError, StageResult, StageSpec};

pub static DESCRIPTOR: StageDescriptor = StageDescriptor {
    type_name: "json-schema",
    display_name: "JSON Schema",
    description: "Validate response against JSON schema",
    is_network_stage: false,
    options: &[OptionMeta {
        name: "schema",
        label: "Schema",
        kind: "object",
        required: true,
        default: None,
        description: "JSON schema to validate the body against",
        placeholder: "{\"type\": \"object\", \"required\": [\"status\"]}",
    }],
    build: JsonSchemaStage::from_spec,
};

pub struct JsonSchemaStage {
    schema: Value,
}

impl JsonSchemaStage {
    pub fn from_spec(spec: &StageSpec) -> Result<Box<dyn Stage>, StageError> {
        spec.warn_unknown_options(&["type", "schema"]);
        let schema = spec
            .opt_object("schema")
            .cloned()
            .map(Value::Object)
            .ok_or_else(|| {
                StageError::BadConfig("json-schema: missing required option `schema`".to_string())
            })?;
        Ok(Box::new(JsonSchemaStage { schema }))
    }
}

#[async_trait]
impl Stage for JsonSchemaStage {
    fn descriptor(&self) -> &'static StageDescriptor {
        &DESCRIPTOR
    }

    async fn check(&self, _url: &str, _verbose: bool, ctx: &mut CheckContext) -> StageResult {
        let Some(body) = ctx.response_body.as_deref() else {
            return StageResult::down("no_response_body")
                .with_detail("error", "no response body to validate");
        };

        let data: Value = match serde_json::from_str(body) {
            Ok(data) => data,
            Err(e) => {
                return StageResult::down("invalid_json").with_detail("error", e.to_string());
            }
        };

        let mut errors = Vec::new();
        validate(&data, &self.schema, "$", &mut errors);

        if let Some(first) = errors.first() {
            return StageResult::down(first.clone())
                .with_detail("errors", json!(errors))
                .with_detail("error_count", errors.len());
        }
        StageResult::up("schema valid").with_detail("valid", true)
    }
}

fn validate(data: &Value, schema: &Value, path: &str, errors: &mut Vec<String>) {
    let Some(schema) = schema.as_object() else {
        return;
    };

    if let Some(expected) = schema.get("type") {
        let matches = match expected {
            Value::String(t) => type_matches(data, t),
            Value::Array(types) => types
                .iter()
                .filter_map(Value::as_str)
                .any(|t| type_matches(data, t)),
            _ => true,
        };
        if !matches {
            errors.push(format!("{path}: expected type {expected}"));
        }
    }

    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(data) {
            errors.push(format!("{path}: value not in enum"));
        }
    }

    if let Value::Object(map) = data {
        if let Some(Value::Array(required)) = schema.get("required") {
            for prop in required.iter().filter_map(Value::as_str) {
                if !map.contains_key(prop) {
                    errors.push(format!("{path}: missing required property '{prop}'"));
                }
            }
        }
        if let Some(Value::Object(properties)) = schema.get("properties") {
            for (prop, prop_schema) in properties {
                if let Some(child) = map.get(prop) {
                    validate(child, prop_schema, &format!("{path}.{prop}"), errors);
                }
            }
        }
    }

    if let Value::Array(items) = data {
        if let Some(item_schema) = schema.get("items") {
            for (i, item) in items.iter().enumerate() {
                validate(item, item_schema, &format!("{path}[{i}]"), errors);
            }
        }
    }

    if let Some(n) = data.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
            if n < min {
                errors.push(format!("{path}: {n} < minimum {min}"));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
            if n > max {
                errors.push(format!("{path}: {n} > maximum {max}"));
            }
        }
    }

    if let Value::String(s) = data {
        if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
            if (s.len() as u64) < min {
                errors.push(format!("{path}: length {} < minLength {min}", s.len()));
            }
        }
        if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
            if (s.len() as u64) > max {
                errors.push(format!("{path}: length {} > maxLength {max}", s.len()));
            }
        }
        if let Some(pattern) = schema.get("pattern").and_then(Value::as_str) {
            match regex::Regex::new(pattern) {
                Ok(re) if !re.is_match(s) => {
                    errors.push(format!("{path}: does not match pattern {pattern}"));
                }
                Ok(_) => {}
                Err(_) => errors.push(format!("{path}: invalid pattern {pattern}")),
            }
        }
    }
}

fn type_matches(data: &Value, expected: &str) -> bool {
    match expected {
        "string" => data.is_string(),
        "number" => data.is_number(),
        "integer" => data.is_i64() || data.is_u64(),
        "boolean" => data.is_boolean(),
        "array" => data.is_array(),
        "object" => data.is_object(),
        "null" => data.is_null(),
        _ => true,
    }
}
