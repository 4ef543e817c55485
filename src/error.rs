//! Error types for NetPulse.
//!
//! This module defines the error types used throughout NetPulse, including
//! the caller-facing error taxonomy that is serialized into job records and
//! HTTP responses.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for NetPulse operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for NetPulse.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Submission Errors
    // ========================================================================
    /// Malformed or inconsistent request.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// API key missing or rejected.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Every live node is at its pinned-worker cap.
    #[error("No node has spare pinned capacity for '{host}' after {attempts} attempts")]
    NoCapacity {
        /// Target device host
        host: String,
        /// Spawn attempts made before giving up
        attempts: u32,
    },

    // ========================================================================
    // Driver Errors
    // ========================================================================
    /// Driver could not establish a session.
    #[error("Failed to connect to '{host}': {message}")]
    ConnectFailed {
        /// Target device host
        host: String,
        /// Error message
        message: String,
    },

    /// Device refused the supplied credentials.
    #[error("Authentication failed for '{host}': {message}")]
    AuthFailed {
        /// Target device host
        host: String,
        /// Error message
        message: String,
    },

    /// Device returned an error pattern in-band.
    #[error("Command failed on '{host}': {message}")]
    CommandFailed {
        /// Target device host
        host: String,
        /// Error message
        message: String,
    },

    /// Unexpected driver-level failure.
    #[error("Driver '{driver}' internal error: {message}")]
    DriverInternal {
        /// Driver name
        driver: String,
        /// Error message
        message: String,
    },

    /// Named driver is not registered.
    #[error("Driver '{0}' not found")]
    DriverNotFound(String),

    /// Named scheduler is not registered.
    #[error("Scheduler '{0}' not found")]
    SchedulerNotFound(String),

    // ========================================================================
    // Job Lifecycle Errors
    // ========================================================================
    /// Execution or queue-life deadline exceeded.
    #[error("Timed out after {timeout_secs} seconds: {context}")]
    Timeout {
        /// Deadline that was exceeded
        timeout_secs: u64,
        /// What timed out (execution, queue-life, spawn reply)
        context: String,
    },

    /// Job was cancelled by the caller.
    #[error("Job '{0}' was cancelled")]
    Cancelled(String),

    /// No job record for the given id.
    #[error("Job '{0}' not found")]
    JobNotFound(String),

    // ========================================================================
    // Infrastructure Errors
    // ========================================================================
    /// Node is unknown or its heartbeat has expired.
    #[error("Node '{0}' not found or expired")]
    NodeNotFound(String),

    /// Node worker rejected or failed a spawn request.
    #[error("Worker spawn failed on node '{node}': {message}")]
    SpawnFailed {
        /// Node that was asked to spawn
        node: String,
        /// Error message
        message: String,
    },

    /// Redis command or connection failure.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates a new validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a new connect-failed error.
    pub fn connect_failed(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectFailed {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Creates a new command-failed error.
    pub fn command_failed(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Creates a new spawn-failed error.
    pub fn spawn_failed(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SpawnFailed {
            node: node.into(),
            message: message.into(),
        }
    }

    /// Creates a new execution timeout error.
    pub fn timeout(timeout_secs: u64, context: impl Into<String>) -> Self {
        Self::Timeout {
            timeout_secs,
            context: context.into(),
        }
    }

    /// Returns the taxonomy kind surfaced to callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::DriverNotFound(_) | Error::SchedulerNotFound(_) => {
                ErrorKind::Validation
            }
            Error::Auth(_) => ErrorKind::Auth,
            Error::NoCapacity { .. } => ErrorKind::NoCapacity,
            Error::ConnectFailed { .. } => ErrorKind::ConnectFailed,
            Error::AuthFailed { .. } => ErrorKind::AuthFailed,
            Error::CommandFailed { .. } => ErrorKind::CommandFailed,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::DriverInternal { .. } => ErrorKind::DriverInternal,
            Error::JobNotFound(_)
            | Error::NodeNotFound(_)
            | Error::SpawnFailed { .. }
            | Error::Redis(_)
            | Error::Config(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::Internal(_) => ErrorKind::System,
        }
    }

    /// Converts this error into the descriptor stored with a failed job.
    pub fn into_descriptor(self) -> JobError {
        JobError {
            kind: self.kind(),
            message: self.to_string(),
            detail: None,
        }
    }
}

/// Caller-facing error taxonomy.
///
/// Every error surfaced through the HTTP API or stored with a failed job is
/// classified into exactly one of these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed request.
    Validation,
    /// Invalid API key.
    Auth,
    /// Pinned spawn impossible; all nodes at cap.
    NoCapacity,
    /// Driver could not establish a session.
    ConnectFailed,
    /// Device refused credentials.
    AuthFailed,
    /// Device returned an error pattern.
    CommandFailed,
    /// Execution or queue-life exceeded.
    Timeout,
    /// User-initiated cancellation.
    Cancelled,
    /// Unexpected driver-level exception.
    DriverInternal,
    /// Redis or process infrastructure failure.
    System,
}

impl ErrorKind {
    /// Returns the snake_case wire name for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::NoCapacity => "no_capacity",
            ErrorKind::ConnectFailed => "connect_failed",
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::CommandFailed => "command_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::DriverInternal => "driver_internal",
            ErrorKind::System => "system",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error descriptor stored as the result of a failed job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobError {
    /// Taxonomy kind
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
    /// Optional diagnostic payload (driver output, stack, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl JobError {
    /// Creates a new descriptor.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    /// Attaches a diagnostic payload.
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl From<Error> for JobError {
    fn from(err: Error) -> Self {
        err.into_descriptor()
    }
}
