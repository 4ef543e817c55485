//! Job model: the unit of work flowing through the queues.
//!
//! A [`Job`] wraps the caller's [`JobRequest`] together with lifecycle state
//! (status, timestamps, result or error). Job records live in Redis hashes
//! and are mutated only by the dispatcher and the executing worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, JobError, Result};
use crate::webhook::WebhookSpec;

/// Name of the single global FIFO queue.
pub const FIFO_QUEUE: &str = "fifo";

/// Deterministic pinned queue name for a device host.
pub fn pinned_queue_name(host: &str) -> String {
    format!("pinned_{}", host)
}

/// Which queue family a job is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStrategy {
    /// Shared queue, stateless workers, fresh session per job.
    Fifo,
    /// Per-device queue served by one worker holding a persisted session.
    Pinned,
}

impl QueueStrategy {
    /// Returns the snake_case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStrategy::Fifo => "fifo",
            QueueStrategy::Pinned => "pinned",
        }
    }
}

impl std::str::FromStr for QueueStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fifo" => Ok(QueueStrategy::Fifo),
            "pinned" => Ok(QueueStrategy::Pinned),
            other => Err(Error::validation(format!(
                "unknown queue_strategy '{}', expected 'fifo' or 'pinned'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for QueueStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command field that accepts either a single string or a list.
///
/// Callers submit `"command": "show version"` as readily as
/// `"command": ["show version", "show ip route"]`; both normalize to a
/// sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CommandSet {
    /// A single command line
    One(String),
    /// An ordered batch of command lines
    Many(Vec<String>),
}

impl CommandSet {
    /// Normalizes to an ordered list.
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            CommandSet::One(cmd) => vec![cmd.clone()],
            CommandSet::Many(cmds) => cmds.clone(),
        }
    }

    /// Returns true if no command lines are present.
    pub fn is_empty(&self) -> bool {
        match self {
            CommandSet::One(cmd) => cmd.trim().is_empty(),
            CommandSet::Many(cmds) => cmds.is_empty(),
        }
    }
}

/// The operation a job performs against the device.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Read-only command execution; result maps command to output.
    Command(Vec<String>),
    /// Configuration push; result holds per-line acknowledgements.
    Config(Vec<String>),
}

impl Operation {
    /// Returns the lines of this operation regardless of kind.
    pub fn lines(&self) -> &[String] {
        match self {
            Operation::Command(lines) | Operation::Config(lines) => lines,
        }
    }

    /// Returns true for configuration pushes.
    pub fn is_config(&self) -> bool {
        matches!(self, Operation::Config(_))
    }
}

/// The full request payload submitted by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// Name of the driver plugin to use
    pub driver: String,

    /// Driver-specific connection arguments (must contain a `host` key)
    pub connection_args: serde_json::Value,

    /// Read operation(s); mutually exclusive with `config`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandSet>,

    /// Configuration statements; mutually exclusive with `command`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Vec<String>>,

    /// Extra driver options passed through to the session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_args: Option<serde_json::Value>,

    /// Queue routing; defaults from driver category when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_strategy: Option<QueueStrategy>,

    /// Queue-life TTL in seconds; default from config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,

    /// Callback fired on terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookSpec>,

    /// Opaque output-parsing spec, stored but not interpreted by the core
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsing: Option<serde_json::Value>,

    /// Opaque template-rendering spec, stored but not interpreted by the core
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendering: Option<serde_json::Value>,
}

impl JobRequest {
    /// Extracts the target device host from the connection arguments.
    pub fn host(&self) -> Result<&str> {
        self.connection_args
            .get("host")
            .and_then(|v| v.as_str())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::validation("connection_args must contain a non-empty 'host'"))
    }

    /// Resolves the operation, enforcing exactly one of command/config.
    pub fn operation(&self) -> Result<Operation> {
        match (&self.command, &self.config) {
            (Some(command), None) => {
                if command.is_empty() {
                    return Err(Error::validation("command must not be empty"));
                }
                Ok(Operation::Command(command.to_vec()))
            }
            (None, Some(config)) => {
                if config.is_empty() {
                    return Err(Error::validation("config must not be empty"));
                }
                Ok(Operation::Config(config.clone()))
            }
            (Some(_), Some(_)) => Err(Error::validation(
                "request must carry either 'command' or 'config', not both",
            )),
            (None, None) => Err(Error::validation(
                "request must carry either 'command' or 'config'",
            )),
        }
    }

    /// Validates the request shape without touching any driver.
    pub fn validate(&self) -> Result<()> {
        if self.driver.trim().is_empty() {
            return Err(Error::validation("driver must not be empty"));
        }
        if !self.connection_args.is_object() {
            return Err(Error::validation("connection_args must be an object"));
        }
        self.host()?;
        self.operation()?;
        if let Some(webhook) = &self.webhook {
            webhook.validate()?;
        }
        Ok(())
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Enqueued, not yet claimed by a worker
    Queued,
    /// Claimed; the driver call is in flight
    Started,
    /// Completed with a driver result
    Finished,
    /// Completed with an error descriptor
    Failed,
    /// Removed or abandoned at the caller's request
    Cancelled,
}

impl JobStatus {
    /// Returns true once the job can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Returns the snake_case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "started" => Ok(JobStatus::Started),
            "finished" => Ok(JobStatus::Finished),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(Error::Internal(format!("unknown job status '{}'", other))),
        }
    }
}

/// A job record as stored in Redis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Opaque job id
    pub id: String,
    /// Queue the job was routed to (`fifo` or `pinned_{host}`)
    pub queue: String,
    /// The submitted payload
    pub request: JobRequest,
    /// Current lifecycle status
    pub status: JobStatus,
    /// Submission time
    pub created_at: DateTime<Utc>,
    /// Claim time, set by the executing worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal-state time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Driver-returned value on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error descriptor on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Execution timeout override in seconds (bulk submissions get the
    /// longer bulk default); `None` means the configured per-job default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Set when the caller requests cooperative cancellation
    #[serde(default)]
    pub cancel_requested: bool,
}

impl Job {
    /// Creates a freshly submitted job in `queued` state.
    pub fn new(queue: impl Into<String>, request: JobRequest) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            queue: queue.into(),
            request,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            result: None,
            error: None,
            timeout_secs: None,
            cancel_requested: false,
        }
    }

    /// Queue-life in seconds, falling back to the given default.
    pub fn queue_life_secs(&self, default_secs: u64) -> u64 {
        self.request.ttl.unwrap_or(default_secs)
    }

    /// Returns true if the job sat queued past its queue-life TTL.
    pub fn queue_expired(&self, default_ttl_secs: u64, now: DateTime<Utc>) -> bool {
        let ttl = self.queue_life_secs(default_ttl_secs);
        let age = now.signed_duration_since(self.created_at);
        age.num_seconds() >= 0 && age.num_seconds() as u64 > ttl
    }

    /// Marks the job started.
    pub fn mark_started(&mut self) {
        self.status = JobStatus::Started;
        self.started_at = Some(Utc::now());
    }

    /// Marks the job finished with a driver result.
    pub fn mark_finished(&mut self, result: serde_json::Value) {
        self.status = JobStatus::Finished;
        self.result = Some(result);
        self.ended_at = Some(Utc::now());
    }

    /// Marks the job failed with an error descriptor.
    pub fn mark_failed(&mut self, error: JobError) {
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.ended_at = Some(Utc::now());
    }

    /// Marks the job cancelled.
    pub fn mark_cancelled(&mut self) {
        self.status = JobStatus::Cancelled;
        self.ended_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(extra: serde_json::Value) -> JobRequest {
        let mut base = json!({
            "driver": "ssh",
            "connection_args": {"host": "10.0.0.1", "username": "u", "password": "p"},
        });
        base.as_object_mut()
            .unwrap()
            .extend(extra.as_object().unwrap().clone());
        serde_json::from_value(base).unwrap()
    }

    #[test]
    fn pinned_queue_name_is_deterministic() {
        assert_eq!(pinned_queue_name("10.0.0.1"), "pinned_10.0.0.1");
        assert_eq!(pinned_queue_name("sw-core-01"), "pinned_sw-core-01");
    }

    #[test]
    fn command_accepts_string_or_list() {
        let single = request(json!({"command": "show version"}));
        assert_eq!(
            single.operation().unwrap(),
            Operation::Command(vec!["show version".to_string()])
        );

        let many = request(json!({"command": ["show version", "show ip route"]}));
        assert_eq!(many.operation().unwrap().lines().len(), 2);
    }

    #[test]
    fn command_and_config_are_exclusive() {
        let both = request(json!({"command": "show version", "config": ["hostname x"]}));
        assert!(both.operation().is_err());

        let neither = request(json!({}));
        assert!(neither.operation().is_err());
    }

    #[test]
    fn validate_rejects_missing_host() {
        let mut req = request(json!({"command": "show version"}));
        req.connection_args = json!({"username": "u"});
        assert!(req.validate().is_err());
    }

    #[test]
    fn queue_expiry_honors_request_ttl() {
        let mut job = Job::new(FIFO_QUEUE, request(json!({"command": "show version"})));
        job.request.ttl = Some(10);

        let now = job.created_at + chrono::Duration::seconds(11);
        assert!(job.queue_expired(1800, now));

        let now = job.created_at + chrono::Duration::seconds(9);
        assert!(!job.queue_expired(1800, now));
    }

    #[test]
    fn status_transitions_set_timestamps() {
        let mut job = Job::new(FIFO_QUEUE, request(json!({"command": "show version"})));
        assert_eq!(job.status, JobStatus::Queued);
        assert!(!job.status.is_terminal());

        job.mark_started();
        assert_eq!(job.status, JobStatus::Started);
        assert!(job.started_at.is_some());

        job.mark_finished(json!({"show version": "IOS XE"}));
        assert!(job.status.is_terminal());
        assert!(job.ended_at.is_some());
    }

    #[test]
    fn job_record_round_trips() {
        let job = Job::new(
            pinned_queue_name("10.0.0.1"),
            request(json!({"command": "show version", "queue_strategy": "pinned"})),
        );
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.queue, "pinned_10.0.0.1");
        assert_eq!(back.request.queue_strategy, Some(QueueStrategy::Pinned));
    }
}
