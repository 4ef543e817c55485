//! Best-effort webhook delivery on job terminal state.
//!
//! Delivery is fire-and-forget: a single request with a clamped timeout, no
//! retry, and failures logged rather than surfaced. Callers that need
//! guaranteed notification must poll `/job`.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::job::Job;

/// Lower clamp for the per-delivery timeout.
const MIN_TIMEOUT_SECS: f64 = 0.5;

/// Upper clamp for the per-delivery timeout.
const MAX_TIMEOUT_SECS: f64 = 120.0;

/// Default per-delivery timeout.
const DEFAULT_TIMEOUT_SECS: f64 = 5.0;

/// Caller-supplied webhook specification attached to a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookSpec {
    /// Destination URL
    pub url: String,

    /// HTTP method; defaults to POST
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Timeout in seconds, clamped to 0.5-120
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,

    /// Extra headers to send with the callback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

impl WebhookSpec {
    /// Validates the URL and method without performing any IO.
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.url)
            .map_err(|e| Error::validation(format!("invalid webhook url '{}': {}", self.url, e)))?;
        self.resolved_method()?;
        Ok(())
    }

    /// Resolves the HTTP method, defaulting to POST.
    pub fn resolved_method(&self) -> Result<Method> {
        match &self.method {
            None => Ok(Method::POST),
            Some(m) => m
                .to_ascii_uppercase()
                .parse::<Method>()
                .map_err(|_| Error::validation(format!("invalid webhook method '{}'", m))),
        }
    }

    /// Clamped delivery timeout.
    pub fn resolved_timeout(&self) -> Duration {
        let secs = self
            .timeout
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS);
        Duration::from_secs_f64(secs)
    }
}

/// Body shipped to the webhook URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Job id
    pub id: String,
    /// Terminal status
    pub status: String,
    /// Driver result on success, error descriptor on failure
    pub result_or_error: serde_json::Value,
    /// Device identity reported by the driver, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_fingerprint: Option<String>,
    /// Driver name from the request
    pub driver: String,
    /// The submitted command or config lines
    pub command_or_config: serde_json::Value,
}

impl WebhookPayload {
    /// Builds the payload for a terminal job.
    pub fn for_job(job: &Job, device_fingerprint: Option<String>) -> Self {
        let result_or_error = match (&job.result, &job.error) {
            (Some(result), _) => result.clone(),
            (None, Some(error)) => serde_json::to_value(error)
                .unwrap_or_else(|_| serde_json::Value::String(error.message.clone())),
            (None, None) => serde_json::Value::Null,
        };

        let command_or_config = if let Some(command) = &job.request.command {
            serde_json::to_value(command).unwrap_or(serde_json::Value::Null)
        } else if let Some(config) = &job.request.config {
            serde_json::to_value(config).unwrap_or(serde_json::Value::Null)
        } else {
            serde_json::Value::Null
        };

        Self {
            id: job.id.clone(),
            status: job.status.to_string(),
            result_or_error,
            device_fingerprint,
            driver: job.request.driver.clone(),
            command_or_config,
        }
    }
}

/// Delivers a webhook for a terminal job.
///
/// Never returns an error to the caller: delivery failures are logged and the
/// job outcome is unaffected.
pub async fn fire(spec: &WebhookSpec, payload: &WebhookPayload) {
    let method = match spec.resolved_method() {
        Ok(m) => m,
        Err(e) => {
            warn!(job_id = %payload.id, error = %e, "Webhook spec invalid, skipping delivery");
            return;
        }
    };

    let client = match reqwest::Client::builder()
        .timeout(spec.resolved_timeout())
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            warn!(job_id = %payload.id, error = %e, "Failed to build webhook client");
            return;
        }
    };

    let mut request = client.request(method, &spec.url).json(payload);
    if let Some(headers) = &spec.headers {
        for (name, value) in headers {
            request = request.header(name, value);
        }
    }

    match request.send().await {
        Ok(response) if response.status().is_success() => {
            debug!(job_id = %payload.id, url = %spec.url, "Webhook delivered");
        }
        Ok(response) => {
            warn!(
                job_id = %payload.id,
                url = %spec.url,
                status = %response.status(),
                "Webhook endpoint returned non-success status"
            );
        }
        Err(e) => {
            warn!(job_id = %payload.id, url = %spec.url, error = %e, "Webhook delivery failed");
        }
    }
}

/// Convenience wrapper: builds the payload from the job and fires it.
pub async fn fire_for_job(job: &Job, device_fingerprint: Option<String>) {
    let Some(spec) = &job.request.webhook else {
        return;
    };
    let payload = WebhookPayload::for_job(job, device_fingerprint);
    fire(spec, &payload).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobRequest, FIFO_QUEUE};
    use serde_json::json;

    fn spec(timeout: Option<f64>, method: Option<&str>) -> WebhookSpec {
        WebhookSpec {
            url: "http://127.0.0.1:9000/hook".to_string(),
            method: method.map(str::to_string),
            timeout,
            headers: None,
        }
    }

    #[test]
    fn timeout_is_clamped() {
        assert_eq!(
            spec(None, None).resolved_timeout(),
            Duration::from_secs_f64(5.0)
        );
        assert_eq!(
            spec(Some(0.1), None).resolved_timeout(),
            Duration::from_secs_f64(0.5)
        );
        assert_eq!(
            spec(Some(600.0), None).resolved_timeout(),
            Duration::from_secs_f64(120.0)
        );
        assert_eq!(
            spec(Some(30.0), None).resolved_timeout(),
            Duration::from_secs_f64(30.0)
        );
    }

    #[test]
    fn method_defaults_to_post() {
        assert_eq!(spec(None, None).resolved_method().unwrap(), Method::POST);
        assert_eq!(
            spec(None, Some("put")).resolved_method().unwrap(),
            Method::PUT
        );
        assert!(spec(None, Some("bad method")).resolved_method().is_err());
    }

    #[test]
    fn invalid_url_fails_validation() {
        let mut s = spec(None, None);
        s.url = "not a url".to_string();
        assert!(s.validate().is_err());
    }

    #[test]
    fn payload_carries_result_or_error() {
        let request: JobRequest = serde_json::from_value(json!({
            "driver": "ssh",
            "connection_args": {"host": "10.0.0.1"},
            "command": "show version",
        }))
        .unwrap();

        let mut job = Job::new(FIFO_QUEUE, request);
        job.mark_finished(json!({"show version": "IOS XE"}));

        let payload = WebhookPayload::for_job(&job, Some("cisco-ios 17.3".to_string()));
        assert_eq!(payload.status, "finished");
        assert_eq!(payload.driver, "ssh");
        assert_eq!(payload.result_or_error["show version"], "IOS XE");
        assert_eq!(payload.command_or_config, json!("show version"));

        let mut failed = job.clone();
        failed.result = None;
        failed.mark_failed(crate::error::JobError::new(
            crate::error::ErrorKind::ConnectFailed,
            "refused",
        ));
        let payload = WebhookPayload::for_job(&failed, None);
        assert_eq!(payload.status, "failed");
        assert_eq!(payload.result_or_error["kind"], "connect_failed");
    }
}
