//! HTTP probe: GET with redirect following, seeds the context for all
//! downstream extractors and assertions.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::stages::registry::{OptionMeta, StageDescriptor};
use crate::stages::{
    normalize_url, CheckContext, Stage, StageError, StageResult, StageSpec, Status,
};

pub const DEFAULT_TIMEOUT_SECS: f64 = 10.0;
pub const MAX_TIMEOUT_SECS: f64 = 60.0;
const MAX_REDIRECTS: usize = 10;

const USER_AGENT: &str = "Mozilla/5.0 (compatible; pulsewatch/0.2)";

pub static DESCRIPTOR: StageDescriptor = StageDescriptor {
    type_name: "http",
    display_name: "HTTP",
    description: "HTTP check with redirect following",
    is_network_stage: true,
    options: &[
        OptionMeta {
            name: "timeout",
            label: "Timeout",
            kind: "number",
            required: false,
            default: Some("10"),
            description: "Request timeout in seconds (capped at 60)",
            placeholder: "10",
        },
        OptionMeta {
            name: "headers",
            label: "Custom Headers",
            kind: "object",
            required: false,
            default: None,
            description: "Custom HTTP headers to send",
            placeholder: "{\"Authorization\": \"Bearer token\"}",
        },
    ],
    build: HttpStage::from_spec,
};

pub struct HttpStage {
    timeout: Duration,
    headers: Vec<(String, String)>,
}

impl HttpStage {
    pub fn from_spec(spec: &StageSpec) -> Result<Box<dyn Stage>, StageError> {
        spec.warn_unknown_options(&["type", "timeout", "headers"]);

        let timeout_secs = spec
            .opt_f64("timeout")
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .clamp(0.0, MAX_TIMEOUT_SECS);
        if timeout_secs <= 0.0 {
            return Err(StageError::BadConfig(
                "http: `timeout` must be a positive number of seconds".to_string(),
            ));
        }

        let mut headers = Vec::new();
        if let Some(map) = spec.opt_object("headers") {
            for (name, value) in map {
                let value = value.as_str().ok_or_else(|| {
                    StageError::BadConfig(format!("http: header `{name}` must be a string"))
                })?;
                headers.push((name.clone(), value.to_string()));
            }
        } else if spec.options.contains_key("headers") {
            return Err(StageError::BadConfig(
                "http: `headers` must be an object".to_string(),
            ));
        }

        Ok(Box::new(HttpStage {
            timeout: Duration::from_secs_f64(timeout_secs),
            headers,
        }))
    }

}

#[async_trait]
impl Stage for HttpStage {
    fn descriptor(&self) -> &'static StageDescriptor {
        &DESCRIPTOR
    }

    async fn check(&self, url: &str, verbose: bool, ctx: &mut CheckContext) -> StageResult {
        let start = Instant::now();

        let client = match reqwest::Client::builder()
            .timeout(self.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                return StageResult::down("transport_error")
                    .with_detail("error", e.to_string())
                    .with_elapsed(elapsed_ms(start));
            }
        };

        let mut target = match url::Url::parse(&normalize_url(url)) {
            Ok(u) => u,
            Err(e) => {
                return StageResult::down("invalid_url")
                    .with_detail("error", e.to_string())
                    .with_elapsed(elapsed_ms(start));
            }
        };

        // Redirects are followed manually so every hop's status and location
        // can be recorded in the details.
        let mut redirects: Vec<Value> = Vec::new();
        let response = loop {
            let mut request = client
                .get(target.clone())
                .header(reqwest::header::USER_AGENT, USER_AGENT);
            for (name, value) in &self.headers {
                request = request.header(name.as_str(), value.as_str());
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    return StageResult::down("transport_error")
                        .with_detail("error", e.to_string())
                        .with_elapsed(elapsed_ms(start));
                }
            };

            if !response.status().is_redirection() {
                break response;
            }
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let Some(location) = location else {
                break response;
            };
            redirects.push(json!({
                "status": response.status().as_u16(),
                "location": location,
            }));
            if redirects.len() > MAX_REDIRECTS {
                return StageResult::down("too_many_redirects")
                    .with_detail("redirects", Value::Array(redirects))
                    .with_elapsed(elapsed_ms(start));
            }
            target = match target.join(&location) {
                Ok(u) => u,
                Err(e) => {
                    return StageResult::down("invalid_redirect")
                        .with_detail("error", e.to_string())
                        .with_elapsed(elapsed_ms(start));
                }
            };
        };

        let status_code = response.status().as_u16();
        let http_version = format!("{:?}", response.version());
        let final_url = response.url().to_string();
        let server = header_string(&response, reqwest::header::SERVER);
        let content_type = header_string(&response, reqwest::header::CONTENT_TYPE);

        let mut headers = std::collections::HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), v.to_string());
            }
        }

        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => {
                return StageResult::down("transport_error")
                    .with_detail("error", e.to_string())
                    .with_elapsed(elapsed_ms(start));
            }
        };
        let elapsed = elapsed_ms(start);

        let status = if status_code < 400 {
            Status::Up
        } else {
            Status::Degraded
        };

        let mut result = StageResult {
            status,
            message: status_code.to_string(),
            elapsed_ms: elapsed,
            details: serde_json::Map::new(),
        };
        result
            .details
            .insert("status_code".to_string(), json!(status_code));
        result
            .details
            .insert("http_version".to_string(), json!(http_version));
        result
            .details
            .insert("final_url".to_string(), json!(final_url));
        if let Some(server) = &server {
            result.details.insert("server".to_string(), json!(server));
        }
        if let Some(content_type) = &content_type {
            result
                .details
                .insert("content_type".to_string(), json!(content_type));
        }
        if !redirects.is_empty() {
            result
                .details
                .insert("redirects".to_string(), Value::Array(redirects.clone()));
        }
        if verbose {
            result
                .details
                .insert("response_headers".to_string(), json!(headers));
        }

        // Seed the context for downstream stages.
        ctx.status_code = Some(status_code);
        ctx.elapsed_ms = elapsed;
        ctx.response_body = Some(body);
        ctx.response_headers = headers;
        ctx.values
            .insert("status_code".to_string(), json!(status_code));
        ctx.values.insert("final_url".to_string(), json!(final_url));
        ctx.values
            .insert("http_version".to_string(), json!(http_version));
        if let Some(server) = server {
            ctx.values.insert("server".to_string(), json!(server));
        }
        if let Some(content_type) = content_type {
            ctx.values
                .insert("content_type".to_string(), json!(content_type));
        }
        ctx.values
            .insert("redirects".to_string(), Value::Array(redirects));

        result
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

fn header_string(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
