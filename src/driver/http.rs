//! HTTP API driver.
//!
//! Stateless driver for devices that expose a command API over HTTP (eAPI
//! style). Every job opens a fresh client; there is nothing to persist, so
//! jobs for these devices default to the fifo queue.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{deserialize_args, Driver, DriverError, DriverResult, Session};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default command endpoint path.
const DEFAULT_ENDPOINT: &str = "/command-api";

/// Connection arguments for the HTTP API driver.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConnectionArgs {
    /// Target host or address
    pub host: String,
    /// Port; omitted means the scheme default
    #[serde(default)]
    pub port: Option<u16>,
    /// `http` or `https`
    #[serde(default = "default_scheme")]
    pub transport: String,
    /// Command endpoint path
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Basic-auth username
    #[serde(default)]
    pub username: Option<String>,
    /// Basic-auth password
    #[serde(default)]
    pub password: Option<String>,
    /// Extra headers sent with every request
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Verify TLS certificates
    #[serde(default = "default_verify")]
    pub verify: bool,
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_verify() -> bool {
    true
}

impl HttpConnectionArgs {
    /// Builds the command endpoint URL.
    fn endpoint_url(&self) -> DriverResult<Url> {
        let authority = match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        };
        let raw = format!("{}://{}{}", self.transport, authority, self.endpoint);
        Url::parse(&raw).map_err(|e| DriverError::InvalidArgs(format!("bad endpoint '{}': {}", raw, e)))
    }
}

/// The HTTP API driver plugin.
#[derive(Debug, Default)]
pub struct HttpDriver;

impl HttpDriver {
    /// Creates the driver.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for HttpDriver {
    fn name(&self) -> &str {
        "http"
    }

    fn description(&self) -> &str {
        "Stateless HTTP command-API driver"
    }

    fn validate_args(&self, args: &serde_json::Value) -> DriverResult<()> {
        let args: HttpConnectionArgs = deserialize_args(args)?;
        args.endpoint_url().map(|_| ())
    }

    async fn connect(
        &self,
        args: &serde_json::Value,
        _driver_args: Option<&serde_json::Value>,
    ) -> DriverResult<Box<dyn Session>> {
        let args: HttpConnectionArgs = deserialize_args(args)?;
        let endpoint = args.endpoint_url()?;

        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(args.timeout));
        if !args.verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| DriverError::ConnectFailed(format!("failed to build client: {}", e)))?;

        debug!(host = %args.host, endpoint = %endpoint, "HTTP API session ready");

        Ok(Box::new(HttpSession {
            identifier: format!("http {}", args.host),
            client,
            endpoint,
            auth: args.username.clone().map(|u| (u, args.password.clone())),
            headers: args.headers,
        }))
    }
}

/// A transient HTTP API session.
pub struct HttpSession {
    identifier: String,
    client: reqwest::Client,
    endpoint: Url,
    auth: Option<(String, Option<String>)>,
    headers: HashMap<String, String>,
}

impl std::fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSession")
            .field("identifier", &self.identifier)
            .field("endpoint", &self.endpoint.as_str())
            .finish_non_exhaustive()
    }
}

impl HttpSession {
    /// Posts one payload to the command endpoint and returns the body.
    async fn post(&self, body: serde_json::Value) -> DriverResult<String> {
        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        if let Some((user, password)) = &self.auth {
            request = request.basic_auth(user, password.as_deref());
        }
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DriverError::ConnectFailed(format!("request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| DriverError::Internal(format!("failed to read body: {}", e)))?;

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(DriverError::AuthFailed(format!("endpoint returned {}", status)));
        }
        if !status.is_success() {
            return Err(DriverError::CommandFailed(format!(
                "endpoint returned {}: {}",
                status,
                text.trim()
            )));
        }
        Ok(text)
    }
}

#[async_trait]
impl Session for HttpSession {
    async fn send(&mut self, commands: &[String]) -> DriverResult<serde_json::Value> {
        let mut results: IndexMap<String, serde_json::Value> =
            IndexMap::with_capacity(commands.len());
        for command in commands {
            let body = self.post(serde_json::json!({"command": command})).await?;
            // Endpoints usually answer JSON; fall back to the raw body.
            let value = serde_json::from_str(&body)
                .unwrap_or_else(|_| serde_json::Value::String(body.clone()));
            results.insert(command.clone(), value);
        }
        serde_json::to_value(results).map_err(|e| DriverError::Internal(e.to_string()))
    }

    async fn config(&mut self, lines: &[String]) -> DriverResult<serde_json::Value> {
        let mut acks = Vec::with_capacity(lines.len());
        for line in lines {
            let body = self.post(serde_json::json!({"config": line})).await?;
            acks.push(serde_json::json!({
                "line": line,
                "output": body,
            }));
        }
        Ok(serde_json::Value::Array(acks))
    }

    async fn is_alive(&mut self) -> bool {
        // Any HTTP answer (even an error status) means the endpoint is up.
        self.client
            .head(self.endpoint.clone())
            .send()
            .await
            .is_ok()
    }

    async fn keepalive(&mut self) -> DriverResult<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> DriverResult<()> {
        Ok(())
    }

    fn fingerprint(&self) -> Option<String> {
        Some(self.identifier.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn args_apply_defaults() {
        let args: HttpConnectionArgs = deserialize_args(&json!({"host": "10.0.0.5"})).unwrap();
        assert_eq!(args.transport, "https");
        assert_eq!(args.endpoint, "/command-api");
        assert_eq!(args.timeout, 10);
        assert!(args.verify);
        assert_eq!(
            args.endpoint_url().unwrap().as_str(),
            "https://10.0.0.5/command-api"
        );
    }

    #[test]
    fn endpoint_url_includes_port() {
        let args: HttpConnectionArgs = deserialize_args(&json!({
            "host": "10.0.0.5",
            "port": 8080,
            "transport": "http",
            "endpoint": "/api",
        }))
        .unwrap();
        assert_eq!(args.endpoint_url().unwrap().as_str(), "http://10.0.0.5:8080/api");
    }

    #[test]
    fn driver_is_stateless() {
        let driver = HttpDriver::new();
        assert!(!driver.supports_persistent_sessions());
        assert_eq!(driver.keepalive_interval(&json!({})), Duration::ZERO);
    }
}
