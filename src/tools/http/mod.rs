use crate::errors::GatewayError;
use crate::tools::base::{InvocationContext, Tool, require_str};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tracing::info;

/// Maximum response body size kept (1 MB).
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Outbound HTTP requests with header and body support.
///
/// Secret templates in headers (e.g. `Authorization: Bearer {{secret:TOKEN}}`)
/// are resolved by the dispatch pipeline before this tool runs.
pub struct HttpRequestTool {
    client: reqwest::Client,
    default_timeout: u64,
}

impl HttpRequestTool {
    pub fn new(default_timeout: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("toolgate/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            default_timeout,
        })
    }
}

#[async_trait]
impl Tool for HttpRequestTool {
    fn category(&self) -> &str {
        "http"
    }

    fn name(&self) -> &str {
        "request"
    }

    fn description(&self) -> &str {
        "Send an HTTP request and return the status, headers, and body."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "method": {"type": "string", "enum": ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"], "default": "GET"},
                "url": {"type": "string"},
                "headers": {"type": "object", "additionalProperties": {"type": "string"}},
                "body": {"description": "Request body; objects are sent as JSON"},
                "timeout": {"type": "integer", "description": "Seconds before the request is aborted"}
            },
            "required": ["url"]
        })
    }

    async fn invoke(
        &self,
        params: Value,
        _ctx: &InvocationContext,
    ) -> Result<Value, GatewayError> {
        let started = Instant::now();
        let url = require_str(&params, "url")?;
        let method = params
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let timeout_secs = params
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(self.default_timeout);

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| GatewayError::InvalidParameter(format!("Invalid method: {}", method)))?;
        let parsed_url: reqwest::Url = url
            .parse()
            .map_err(|e| GatewayError::InvalidParameter(format!("Invalid URL '{}': {}", url, e)))?;
        if !matches!(parsed_url.scheme(), "http" | "https") {
            return Err(GatewayError::InvalidParameter(format!(
                "Unsupported URL scheme: {}",
                parsed_url.scheme()
            )));
        }

        let mut request = self
            .client
            .request(method.clone(), parsed_url)
            .timeout(Duration::from_secs(timeout_secs));

        if let Some(headers) = params.get("headers").and_then(Value::as_object) {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(key, value);
                }
            }
        }
        match params.get("body") {
            Some(Value::String(body)) => request = request.body(body.clone()),
            Some(Value::Null) | None => {}
            Some(body) => request = request.json(body),
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(format!("Request timed out after {} seconds", timeout_secs))
            } else {
                GatewayError::Internal(anyhow::anyhow!("request failed: {}", e))
            }
        })?;

        let status = response.status().as_u16();
        let mut headers = serde_json::Map::new();
        for (key, value) in response.headers() {
            headers.insert(
                key.to_string(),
                Value::String(value.to_str().unwrap_or("").to_string()),
            );
        }

        let body_bytes = response.bytes().await.map_err(|e| {
            GatewayError::Internal(anyhow::anyhow!("failed to read response body: {}", e))
        })?;
        let truncated = body_bytes.len() > MAX_BODY_BYTES;
        let body_text = String::from_utf8_lossy(&body_bytes[..body_bytes.len().min(MAX_BODY_BYTES)])
            .into_owned();
        // Surface JSON bodies as structure when they parse.
        let body: Value = serde_json::from_str(&body_text)
            .unwrap_or_else(|_| Value::String(body_text));

        let duration_ms = started.elapsed().as_millis() as i64;
        info!(method = %method, url, status, duration_ms, "http request");

        Ok(json!({
            "status": status,
            "headers": Value::Object(headers),
            "body": body,
            "truncated": truncated,
            "duration_ms": duration_ms,
        }))
    }
}
