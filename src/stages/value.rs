//! `$name` value references: the mini-language that glues extractors to
//! assertions.

use serde_json::Value;

use crate::stages::CheckContext;

/// A reference that named no known value; surfaces as a stage-level `down`
/// with message `unresolved $name`.
#[derive(Debug, PartialEq, Eq)]
pub struct UnresolvedValue(pub String);

impl UnresolvedValue {
    pub fn message(&self) -> String {
        format!("unresolved ${}", self.0)
    }
}

/// Resolve a stage input that may be either a literal or a `$name` reference.
///
/// Extractor-stored names take precedence; the built-ins `$elapsed_ms`,
/// `$status_code`, and `$response_length` are derived from the context when no
/// stored value shadows them.
pub fn resolve(raw: &Value, ctx: &CheckContext) -> Result<Value, UnresolvedValue> {
    let Value::String(s) = raw else {
        return Ok(raw.clone());
    };
    let Some(name) = s.strip_prefix('$') else {
        return Ok(raw.clone());
    };

    if let Some(stored) = ctx.values.get(name) {
        return Ok(stored.clone());
    }

    match name {
        "elapsed_ms" => Ok(Value::from(ctx.elapsed_ms)),
        "status_code" => ctx
            .status_code
            .map(Value::from)
            .ok_or_else(|| UnresolvedValue(name.to_string())),
        "response_length" => Ok(Value::from(
            ctx.response_body.as_ref().map_or(0, String::len),
        )),
        _ => Err(UnresolvedValue(name.to_string())),
    }
}

/// Resolve to a number, distinguishing "no such value" from "not numeric".
pub fn resolve_number(raw: &Value, ctx: &CheckContext) -> Result<Result<f64, Value>, UnresolvedValue> {
    let resolved = resolve(raw, ctx)?;
    Ok(as_number(&resolved).ok_or(resolved))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_with(values: &[(&str, Value)]) -> CheckContext {
        let mut ctx = CheckContext::new();
        for (k, v) in values {
            ctx.values.insert(k.to_string(), v.clone());
        }
        ctx
    }

    #[test]
    fn literals_pass_through() {
        let ctx = CheckContext::new();
        assert_eq!(resolve(&json!(42), &ctx).unwrap(), json!(42));
        assert_eq!(resolve(&json!("plain"), &ctx).unwrap(), json!("plain"));
    }

    #[test]
    fn stored_values_resolve() {
        let ctx = ctx_with(&[("count", json!(7))]);
        assert_eq!(resolve(&json!("$count"), &ctx).unwrap(), json!(7));
    }

    #[test]
    fn builtin_elapsed_ms_resolves() {
        let mut ctx = CheckContext::new();
        ctx.elapsed_ms = 123.5;
        assert_eq!(resolve(&json!("$elapsed_ms"), &ctx).unwrap(), json!(123.5));
    }

    #[test]
    fn missing_name_is_unresolved() {
        let ctx = CheckContext::new();
        let err = resolve(&json!("$nope"), &ctx).unwrap_err();
        assert_eq!(err.message(), "unresolved $nope");
    }

    #[test]
    fn stored_value_shadows_builtin() {
        let mut ctx = ctx_with(&[("elapsed_ms", json!(9.0))]);
        ctx.elapsed_ms = 500.0;
        assert_eq!(resolve(&json!("$elapsed_ms"), &ctx).unwrap(), json!(9.0));
    }

    #[test]
    fn numeric_strings_resolve_to_numbers() {
        let ctx = ctx_with(&[("v", json!("12.5"))]);
        assert_eq!(resolve_number(&json!("$v"), &ctx).unwrap(), Ok(12.5));
        let ctx = ctx_with(&[("v", json!([1]))]);
        assert!(resolve_number(&json!("$v"), &ctx).unwrap().is_err());
    }
}
