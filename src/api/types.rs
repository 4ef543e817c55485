//! API request and response types.
//!
//! Submission bodies deserialize directly into [`crate::job::JobRequest`];
//! the types here cover the remaining wire shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dispatch::CancelOutcome;
use crate::error::JobError;
use crate::job::{Job, JobStatus};

/// Body of `POST /device/test`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRequest {
    /// Driver plugin name
    pub driver: String,
    /// Driver-specific connection arguments
    pub connection_args: serde_json::Value,
    /// Extra driver options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_args: Option<serde_json::Value>,
}

/// Query string of `GET /job` and `DELETE /job`.
#[derive(Debug, Clone, Deserialize)]
pub struct JobQuery {
    /// Job id
    pub id: String,
}

/// Query string of `GET /jobs`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobListQuery {
    /// Restrict to one lifecycle status
    #[serde(default)]
    pub status: Option<JobStatus>,
}

/// Query string of `DELETE /worker`.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerQuery {
    /// Device host whose pinned worker should be terminated
    pub name: String,
}

/// Job record as returned by `GET /job`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    /// Job id
    pub id: String,
    /// Lifecycle status
    pub status: JobStatus,
    /// Queue the job was routed to
    pub queue: String,
    /// Driver result, present once finished
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error descriptor, present once failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Submission time
    pub created_at: DateTime<Utc>,
    /// Claim time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal-state time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            queue: job.queue,
            result: job.result,
            error: job.error,
            created_at: job.created_at,
            started_at: job.started_at,
            ended_at: job.ended_at,
        }
    }
}

/// Response of `DELETE /job`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    /// Job id
    pub id: String,
    /// What the cancellation achieved
    #[serde(flatten)]
    pub outcome: CancelOutcome,
}

/// Response of `DELETE /worker`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminateResponse {
    /// Device host from the request
    pub name: String,
    /// Whether a worker was found and signalled
    pub terminated: bool,
}

/// Response of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `healthy` when Redis answers
    pub status: String,
    /// Crate version
    pub version: String,
    /// Seconds since start
    pub uptime_secs: u64,
    /// Registered driver names
    pub drivers: Vec<String>,
}
