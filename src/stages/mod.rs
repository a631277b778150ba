//! Pluggable stage system: the stage contract, the shared check context, and
//! the concrete network probes, extractors, and assertions.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod age;
pub mod contains;
pub mod dns;
pub mod header;
pub mod http;
pub mod jq;
pub mod json_schema;
pub mod jsonpath;
pub mod regex;
pub mod registry;
pub mod ssl;
pub mod tcp;
pub mod threshold;
pub mod value;

pub use registry::{get_stage, registry, OptionMeta, StageDescriptor};

/// Verdict of a single stage or of a whole pipeline run.
///
/// Ordered so that the aggregate verdict is simply the maximum over all
/// executed stages: `Up < Degraded < Down`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Up,
    Degraded,
    Down,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Up => "up",
            Status::Degraded => "degraded",
            Status::Down => "down",
        }
    }

    pub fn parse(s: &str) -> Option<Status> {
        match s {
            "up" => Some(Status::Up),
            "degraded" => Some(Status::Degraded),
            "down" => Some(Status::Down),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one stage invocation.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub status: Status,
    pub message: String,
    pub elapsed_ms: f64,
    pub details: serde_json::Map<String, Value>,
}

impl StageResult {
    pub fn up(message: impl Into<String>) -> Self {
        Self::new(Status::Up, message)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(Status::Degraded, message)
    }

    pub fn down(message: impl Into<String>) -> Self {
        Self::new(Status::Down, message)
    }

    fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            elapsed_ms: 0.0,
            details: serde_json::Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn with_elapsed(mut self, elapsed_ms: f64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }
}

/// Scratch space carried between the stages of one pipeline run.
///
/// Owned by the executor for the duration of the run and handed to each stage
/// by mutable reference; it never outlives the run. Network stages seed the
/// response fields, extractors add to `values`, assertions only read.
#[derive(Debug, Default)]
pub struct CheckContext {
    pub response_body: Option<String>,
    /// Header names are stored lowercased so lookups are case-insensitive.
    pub response_headers: HashMap<String, String>,
    pub status_code: Option<u16>,
    pub values: HashMap<String, Value>,
    /// Wall-clock of the most recent network stage, in milliseconds.
    pub elapsed_ms: f64,
}

impl CheckContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(&self, name: &str) -> Option<&String> {
        self.response_headers.get(&name.to_ascii_lowercase())
    }
}

/// One entry of a monitor's pipeline: a stage type plus its open option map.
///
/// Options are validated lazily by the stage constructor so that new stage
/// types can be added without touching the monitor schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    #[serde(rename = "type")]
    pub stage_type: String,
    #[serde(flatten)]
    pub options: serde_json::Map<String, Value>,
}

impl StageSpec {
    pub fn new(stage_type: &str) -> Self {
        Self {
            stage_type: stage_type.to_string(),
            options: serde_json::Map::new(),
        }
    }

    pub fn with_option(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    pub fn opt_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    pub fn opt_f64(&self, key: &str) -> Option<f64> {
        self.options.get(key).and_then(Value::as_f64)
    }

    pub fn opt_u16(&self, key: &str) -> Option<u16> {
        self.options
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|v| u16::try_from(v).ok())
    }

    pub fn opt_bool(&self, key: &str) -> Option<bool> {
        self.options.get(key).and_then(Value::as_bool)
    }

    pub fn opt_object(&self, key: &str) -> Option<&serde_json::Map<String, Value>> {
        self.options.get(key).and_then(Value::as_object)
    }

    /// Required string option, `BadConfig` when missing or not a string.
    pub fn require_str(&self, key: &str) -> Result<String, StageError> {
        self.opt_str(key).map(str::to_string).ok_or_else(|| {
            StageError::BadConfig(format!(
                "{}: missing required option `{}`",
                self.stage_type, key
            ))
        })
    }

    /// Log (but tolerate) option keys the stage does not understand.
    pub fn warn_unknown_options(&self, known: &[&str]) {
        for key in self.options.keys() {
            if !known.contains(&key.as_str()) {
                tracing::warn!(
                    stage_type = %self.stage_type,
                    option = %key,
                    "Ignoring unknown stage option."
                );
            }
        }
    }
}

/// Errors raised while resolving or constructing stages from specs.
///
/// Runtime stage failures are never errors: stages report them as `down`
/// results and the executor treats them as data.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("unknown stage type: {0}")]
    UnknownStage(String),
    #[error("invalid stage config: {0}")]
    BadConfig(String),
}

/// The contract every network probe, extractor, and assertion implements.
///
/// `check` receives the monitor URL, a verbosity flag, and the live context.
/// A stage may write `response_body`/`response_headers` (network stages only)
/// and add to `values`; it must never remove or rename keys set by earlier
/// stages.
#[async_trait]
pub trait Stage: Send + Sync {
    fn descriptor(&self) -> &'static StageDescriptor;

    async fn check(&self, url: &str, verbose: bool, ctx: &mut CheckContext) -> StageResult;
}

/// Default scheme applied to bare host names before probing.
pub(crate) fn normalize_url(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}

/// Host portion of a monitor URL, shared by the ssl/tcp/dns probes.
pub(crate) fn host_of(url: &str) -> Option<(url::Url, String)> {
    let parsed = url::Url::parse(&normalize_url(url)).ok()?;
    let host = parsed.host_str()?.to_string();
    Some((parsed, host))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_orders_worst_last() {
        assert!(Status::Up < Status::Degraded);
        assert!(Status::Degraded < Status::Down);
        assert_eq!(
            [Status::Up, Status::Down, Status::Degraded]
                .into_iter()
                .max(),
            Some(Status::Down)
        );
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [Status::Up, Status::Degraded, Status::Down] {
            assert_eq!(Status::parse(status.as_str()), Some(status));
        }
        assert_eq!(Status::parse("unknown"), None);
    }

    #[test]
    fn stage_spec_deserializes_open_options() {
        let spec: StageSpec =
            serde_json::from_value(serde_json::json!({
                "type": "threshold",
                "value": "$c",
                "min": 10,
                "future_option": true,
            }))
            .unwrap();
        assert_eq!(spec.stage_type, "threshold");
        assert_eq!(spec.opt_str("value"), Some("$c"));
        assert_eq!(spec.opt_f64("min"), Some(10.0));
        assert_eq!(spec.opt_bool("future_option"), Some(true));
    }

    #[test]
    fn context_headers_are_case_insensitive() {
        let mut ctx = CheckContext::new();
        ctx.response_headers
            .insert("content-type".to_string(), "text/html".to_string());
        assert_eq!(ctx.header("Content-Type").map(String::as_str), Some("text/html"));
    }

    #[test]
    fn normalize_url_defaults_to_https() {
        assert_eq!(normalize_url("example.com"), "https://example.com");
        assert_eq!(normalize_url("http://example.com"), "http://example.com");
    }
}
