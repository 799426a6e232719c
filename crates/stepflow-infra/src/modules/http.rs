//! `http.request.send`: a generic HTTP call.
//!
//! Input: `method` (default GET), `url`, optional `headers` (string map),
//! `body` (JSON) and `timeoutMs`. Output: `{status, headers, body}`, where
//! `body` is parsed as JSON when possible and kept as text otherwise.
//! Non-2xx responses fail with the response as error details.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value, json};

use stepflow_core::module::{BoxModule, Module, ModuleDescriptor, ModuleError};
use stepflow_types::module::{ModulePathError, ParamSpec, ParamType};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpRequestParams {
    #[serde(default = "default_method")]
    method: String,
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// HTTP module backed by a shared `reqwest::Client`.
#[derive(Clone)]
pub struct HttpRequestModule {
    client: reqwest::Client,
}

impl HttpRequestModule {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("stepflow/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    async fn send(&self, params: HttpRequestParams) -> Result<Value, ModuleError> {
        let method = reqwest::Method::from_bytes(params.method.to_uppercase().as_bytes())
            .map_err(|_| ModuleError::new(format!("invalid HTTP method '{}'", params.method)))?;

        let mut request = self.client.request(method.clone(), &params.url);
        for (name, value) in &params.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &params.body {
            request = request.json(body);
        }
        if let Some(ms) = params.timeout_ms {
            request = request.timeout(Duration::from_millis(ms));
        }

        tracing::debug!(method = %method, url = %params.url, "sending HTTP request");
        let response = request.send().await.map_err(|e| {
            ModuleError::new(format!("{method} {} failed: {e}", params.url))
        })?;

        let status = response.status();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
                )
            })
            .collect();
        let text = response.text().await.map_err(|e| {
            ModuleError::new(format!("failed to read response from {}: {e}", params.url))
        })?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        let result = json!({
            "status": status.as_u16(),
            "headers": headers,
            "body": body,
        });

        if status.is_success() {
            Ok(result)
        } else {
            Err(ModuleError::new(format!("{method} {} returned {status}", params.url))
                .with_details(result))
        }
    }
}

impl Module for HttpRequestModule {
    async fn call(&self, input: Value) -> Result<Value, ModuleError> {
        let params: HttpRequestParams = serde_json::from_value(input)
            .map_err(|e| ModuleError::new(format!("invalid http.request.send parameters: {e}")))?;
        self.send(params).await
    }
}

pub(crate) fn descriptor(module: HttpRequestModule) -> Result<ModuleDescriptor, ModulePathError> {
    Ok(ModuleDescriptor::new(
        "http.request.send",
        "Send an HTTP request and return status, headers and body",
        BoxModule::new(module),
    )?
    .with_params(vec![
        ParamSpec::optional("method", ParamType::String, "HTTP method, default GET"),
        ParamSpec::required("url", ParamType::String, "Request URL"),
        ParamSpec::optional("headers", ParamType::Object, "Header name to value"),
        ParamSpec::optional("body", ParamType::Any, "JSON request body"),
        ParamSpec::optional("timeoutMs", ParamType::Number, "Per-request timeout"),
    ]))
}
