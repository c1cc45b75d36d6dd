//! Mediated outbound HTTP.
//!
//! The sandbox never sees a socket. It hands an axios-style config to the
//! `request` capability; the host validates it, performs the call with a
//! shared `reqwest::Client` on the host runtime and returns a classified
//! response.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::boundary::{make_transferable, render, HostFunction, HostObject, HostResult, HostValue};
use crate::error::RunError;

/// Host-side limits for outbound requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSettings {
    /// Applies when the sandbox does not pass its own `timeout`.
    pub timeout_ms: u64,
    pub max_response_bytes: usize,
    pub user_agent: String,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_response_bytes: 5 * 1024 * 1024,
            user_agent: format!("fnbox/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// A validated request as described by sandbox code.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestConfig {
    pub url: Url,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub params: Vec<(String, String)>,
    pub data: Option<Value>,
    pub timeout: Option<Duration>,
}

impl RequestConfig {
    /// Validate an axios-style config object.
    pub fn from_json(config: &Value) -> Result<Self, String> {
        let config = match config {
            Value::String(url) => return Self::from_json(&serde_json::json!({ "url": url })),
            Value::Object(map) => map,
            _ => return Err("request config must be an object".to_string()),
        };

        let raw_url = config
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| "request config requires a url".to_string())?;
        let url = Url::parse(raw_url).map_err(|e| format!("Invalid URL: {e}"))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(format!("Unsupported protocol {}:", url.scheme()));
        }

        let method = match config.get("method").and_then(Value::as_str) {
            Some(name) => Method::from_bytes(name.to_ascii_uppercase().as_bytes())
                .map_err(|_| format!("Invalid method {name}"))?,
            None => Method::GET,
        };

        Ok(Self {
            url,
            method,
            headers: string_pairs(config.get("headers")),
            params: string_pairs(config.get("params")),
            data: config.get("data").filter(|d| !d.is_null()).cloned(),
            timeout: config
                .get("timeout")
                .and_then(Value::as_u64)
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
        })
    }

    pub fn from_host(config: HostValue) -> Result<Self, String> {
        Self::from_json(&render(&make_transferable(config)))
    }
}

fn string_pairs(value: Option<&Value>) -> Vec<(String, String)> {
    let Some(Value::Object(map)) = value else {
        return Vec::new();
    };
    map.iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), v)
        })
        .collect()
}

/// A completed HTTP exchange, before classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub data: Value,
}

impl HttpResponse {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Plain-data form used where handles cannot cross.
    pub fn to_json(&self) -> Value {
        let headers: serde_json::Map<String, Value> = self
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        serde_json::json!({
            "status": self.status,
            "statusText": self.status_text,
            "headers": headers,
            "data": self.data,
            "ok": self.ok(),
        })
    }

    /// Response object exposed through a proxy with `clone` denied.
    pub fn into_host(self) -> HostObject {
        let copy = HostValue::from(self.to_json());
        HostObject::proxied(&["clone"])
            .with("status", self.status as f64)
            .with("statusText", self.status_text.clone())
            .with("headers", headers_object(&self.headers))
            .with("data", HostValue::from(self.data.clone()))
            .with("ok", self.ok())
            .with("clone", HostFunction::sync(move |_| Ok(copy.clone())))
    }

    /// Rejection value for a non-2xx status.
    pub fn into_rejection(self) -> HostValue {
        HostValue::Object(
            HostObject::new()
                .with("message", format!("Request failed with status code {}", self.status))
                .with("status", self.status as f64)
                .with("data", HostValue::from(self.data)),
        )
    }
}

fn headers_object(headers: &[(String, String)]) -> HostObject {
    headers
        .iter()
        .fold(HostObject::new(), |obj, (k, v)| obj.with(k.clone(), v.clone()))
}

/// Failure of the exchange itself, rejected into the sandbox as a
/// `HostBridgeError` carrying `{name, message}`.
pub fn rejection(message: impl Into<String>) -> HostValue {
    let message = message.into();
    let error = RunError::bridge(message.clone());
    debug!(error = %error, "mediated request rejected");
    HostValue::Object(
        HostObject::new()
            .with("name", error.name())
            .with("message", message),
    )
}

struct ExchangeTask(JoinHandle<Result<HttpResponse, String>>);

impl Drop for ExchangeTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Shared outbound HTTP client bound to the host runtime.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    settings: RequestSettings,
    runtime: tokio::runtime::Handle,
}

impl HttpClient {
    /// Must be called from within the host tokio runtime.
    pub fn new(settings: RequestSettings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self {
            client,
            settings,
            runtime: tokio::runtime::Handle::try_current()?,
        })
    }

    pub fn settings(&self) -> &RequestSettings {
        &self.settings
    }

    /// The sandbox-facing `request(config)` function.
    pub fn capability(&self) -> HostFunction {
        let http = self.clone();
        HostFunction::asynchronous(move |args: Vec<HostValue>| {
            let http = http.clone();
            async move {
                let config = args.into_iter().next().unwrap_or_default();
                let config = RequestConfig::from_host(config).map_err(rejection)?;
                http.settle(config).await
            }
        })
    }

    /// Perform `config` and classify the outcome the way axios does.
    pub async fn settle(&self, config: RequestConfig) -> HostResult {
        match self.send(config).await {
            Ok(response) if response.ok() => Ok(HostValue::Object(response.into_host())),
            Ok(response) => Err(response.into_rejection()),
            Err(message) => Err(rejection(message)),
        }
    }

    /// Run the exchange on the host runtime. Sandbox threads own short-lived
    /// runtimes; pooled connections must not be tied to them. Dropping the
    /// returned future aborts the exchange.
    pub async fn send(&self, config: RequestConfig) -> Result<HttpResponse, String> {
        let http = self.clone();
        let mut task = ExchangeTask(self.runtime.spawn(async move { http.exchange(config).await }));
        (&mut task.0)
            .await
            .map_err(|e| format!("request task failed: {e}"))?
    }

    async fn exchange(&self, config: RequestConfig) -> Result<HttpResponse, String> {
        let timeout = config
            .timeout
            .unwrap_or(Duration::from_millis(self.settings.timeout_ms));
        debug!(method = %config.method, url = %config.url, "outbound request");

        let mut builder = self
            .client
            .request(config.method.clone(), config.url.clone())
            .timeout(timeout);
        for (name, value) in &config.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !config.params.is_empty() {
            builder = builder.query(&config.params);
        }
        builder = match config.data {
            Some(Value::String(text)) => builder.body(text),
            Some(data) => builder.json(&data),
            None => builder,
        };

        let mut response = builder.send().await.map_err(|e| {
            warn!(url = %config.url, error = %e, "outbound request failed");
            if e.is_timeout() {
                format!("timeout of {}ms exceeded", timeout.as_millis())
            } else {
                e.to_string()
            }
        })?;

        let status = response.status();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("json"));

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| e.to_string())? {
            if body.len() + chunk.len() > self.settings.max_response_bytes {
                return Err("Response body too large".to_string());
            }
            body.extend_from_slice(&chunk);
        }

        let data = if is_json {
            serde_json::from_slice(&body)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()))
        } else {
            Value::String(String::from_utf8_lossy(&body).into_owned())
        };

        debug!(status = status.as_u16(), bytes = body.len(), "outbound request complete");
        Ok(HttpResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_config_defaults_to_get() {
        let config = RequestConfig::from_json(&json!({"url": "http://localhost/a"})).unwrap();
        assert_eq!(config.method, Method::GET);
        assert!(config.headers.is_empty());
        assert!(config.data.is_none());
    }

    #[test]
    fn test_config_accepts_bare_url() {
        let config = RequestConfig::from_json(&json!("https://example.com/")).unwrap();
        assert_eq!(config.url.host_str(), Some("example.com"));
    }

    #[test]
    fn test_config_rejects_other_schemes() {
        let err = RequestConfig::from_json(&json!({"url": "file:///etc/passwd"})).unwrap_err();
        assert!(err.contains("Unsupported protocol"));
        assert!(RequestConfig::from_json(&json!({"method": "GET"})).is_err());
    }

    #[test]
    fn test_config_stringifies_headers_and_params() {
        let config = RequestConfig::from_json(&json!({
            "url": "http://localhost/",
            "method": "post",
            "headers": {"x-n": 1},
            "params": {"q": "rust", "skip": null},
            "timeout": 250
        }))
        .unwrap();
        assert_eq!(config.method, Method::POST);
        assert_eq!(config.headers, vec![("x-n".to_string(), "1".to_string())]);
        assert_eq!(config.params, vec![("q".to_string(), "rust".to_string())]);
        assert_eq!(config.timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_response_proxy_hides_clone() {
        let response = HttpResponse {
            status: 200,
            status_text: "OK".into(),
            headers: vec![("content-type".into(), "application/json".into())],
            data: json!({"a": 1}),
        };
        let rendered = render(&make_transferable(HostValue::Object(response.into_host())));
        assert_eq!(rendered["status"], 200);
        assert_eq!(rendered["data"], json!({"a": 1}));
        assert_eq!(rendered["ok"], true);
        assert!(rendered.get("clone").is_none());
    }

    #[test]
    fn test_error_status_rejects_axios_style() {
        let response = HttpResponse {
            status: 404,
            status_text: "Not Found".into(),
            headers: vec![],
            data: json!("missing"),
        };
        assert!(!response.ok());
        let rejected = render(&make_transferable(response.into_rejection()));
        assert_eq!(rejected["message"], "Request failed with status code 404");
        assert_eq!(rejected["status"], 404);
    }

    #[test]
    fn test_exchange_failure_rejects_as_host_bridge_error() {
        let rejected = render(&make_transferable(rejection("connection refused")));
        assert_eq!(
            rejected,
            json!({"name": "HostBridgeError", "message": "connection refused"})
        );
    }

    #[tokio::test]
    async fn test_dropped_send_aborts_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Read the request, never answer, wait for the client to hang up.
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            while let Ok(n) = socket.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });

        let http = HttpClient::new(RequestSettings::default()).unwrap();
        let config = RequestConfig::from_json(&json!({
            "url": format!("http://{addr}/slow"),
            "timeout": 30_000
        }))
        .unwrap();
        let gave_up = tokio::time::timeout(Duration::from_millis(200), http.send(config)).await;
        assert!(gave_up.is_err());

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("connection outlived the dropped request")
            .unwrap();
    }
}
