//! Driver plugin system.
//!
//! Drivers are the units of device knowledge in NetPulse: each one knows how
//! to open a session against one family of devices and run read or
//! configuration operations over it. The executing worker owns the session
//! and serializes every call; drivers never synchronize internally.
//!
//! Drivers are registered statically at startup (no directory scanning); the
//! `drivers.enabled` configuration list selects which compiled-in plugins
//! are available.

pub mod http;
pub mod sftp;
pub mod ssh;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::error::{Error, Result};

/// Result type for driver operations.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Errors produced by driver implementations.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Session could not be established.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Device or transport refused the credentials.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Device reported an error for a command or config line.
    #[error("command failed: {0}")]
    CommandFailed(String),

    /// Invalid or missing connection arguments.
    #[error("invalid connection args: {0}")]
    InvalidArgs(String),

    /// Operation not supported by this driver.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// File transfer failure.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// Driver-level timeout.
    #[error("timed out after {0} seconds")]
    Timeout(u64),

    /// Unexpected protocol or library failure.
    #[error("{0}")]
    Internal(String),
}

impl DriverError {
    /// Wraps this error into the crate taxonomy with driver and host context.
    pub fn into_error(self, driver: &str, host: &str) -> Error {
        match self {
            DriverError::ConnectFailed(message) => Error::connect_failed(host, message),
            DriverError::AuthFailed(message) => Error::AuthFailed {
                host: host.to_string(),
                message,
            },
            DriverError::CommandFailed(message) => Error::command_failed(host, message),
            DriverError::InvalidArgs(message) => Error::validation(format!(
                "driver '{}' rejected connection args: {}",
                driver, message
            )),
            DriverError::Timeout(secs) => Error::timeout(secs, format!("driver '{}'", driver)),
            DriverError::Unsupported(message)
            | DriverError::Transfer(message)
            | DriverError::Internal(message) => Error::DriverInternal {
                driver: driver.to_string(),
                message,
            },
        }
    }
}

/// Deserializes driver-specific connection args from the request's JSON map.
pub fn deserialize_args<T: DeserializeOwned>(value: &serde_json::Value) -> DriverResult<T> {
    serde_json::from_value(value.clone()).map_err(|e| DriverError::InvalidArgs(e.to_string()))
}

/// Canonical signature of a connection-args value.
///
/// Object keys are sorted recursively, so two argument maps that differ only
/// in key order produce the same signature. The pinned worker compares
/// signatures to decide whether a persisted session may be reused.
pub fn args_signature(value: &serde_json::Value) -> String {
    fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let sorted: std::collections::BTreeMap<String, serde_json::Value> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect();
                serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(canonicalize).collect())
            }
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}

/// A live connection to one device.
///
/// Sessions are owned by exactly one worker at a time; the owner guards all
/// calls with a mutex so `send`, `config`, and `keepalive` never interleave.
#[async_trait]
pub trait Session: Send + Sync + std::fmt::Debug {
    /// Executes a sequence of read operations.
    ///
    /// Returns a mapping from command to output (insertion-ordered).
    async fn send(&mut self, commands: &[String]) -> DriverResult<serde_json::Value>;

    /// Pushes a sequence of configuration statements.
    ///
    /// Returns per-line acknowledgements.
    async fn config(&mut self, lines: &[String]) -> DriverResult<serde_json::Value>;

    /// Cheap liveness probe.
    async fn is_alive(&mut self) -> bool;

    /// Application-layer nudge exercising the transport and resetting the
    /// remote idle timer.
    async fn keepalive(&mut self) -> DriverResult<()>;

    /// Best-effort release of the connection.
    async fn disconnect(&mut self) -> DriverResult<()>;

    /// Device identity for webhooks and connection tests, when known.
    fn fingerprint(&self) -> Option<String>;
}

/// A driver plugin: knows how to open sessions against one device family.
#[async_trait]
pub trait Driver: Send + Sync + std::fmt::Debug {
    /// Unique plugin name used in requests.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        "No description available"
    }

    /// Whether sessions opened by this driver may be persisted and reused
    /// across jobs by a pinned worker.
    fn supports_persistent_sessions(&self) -> bool {
        false
    }

    /// Keepalive interval requested by the connection args.
    ///
    /// `Duration::ZERO` disables the keepalive monitor.
    fn keepalive_interval(&self, args: &serde_json::Value) -> Duration {
        let _ = args;
        Duration::ZERO
    }

    /// Validates connection args without opening a session.
    fn validate_args(&self, args: &serde_json::Value) -> DriverResult<()> {
        let _ = args;
        Ok(())
    }

    /// Opens a session to the device described by the connection args.
    async fn connect(
        &self,
        args: &serde_json::Value,
        driver_args: Option<&serde_json::Value>,
    ) -> DriverResult<Box<dyn Session>>;
}

/// Registry for looking up drivers by name.
#[derive(Debug, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// Creates a registry holding the named built-in drivers.
    ///
    /// Unknown names fail startup rather than silently vanishing.
    pub fn with_builtins(enabled: &[String]) -> Result<Self> {
        let mut registry = Self::new();
        for name in enabled {
            match name.as_str() {
                "ssh" => registry.register(Arc::new(ssh::SshDriver::new())),
                "http" => registry.register(Arc::new(http::HttpDriver::new())),
                "sftp" => registry.register(Arc::new(sftp::SftpDriver::new())),
                other => {
                    return Err(Error::Config(format!(
                        "unknown driver '{}' in drivers.enabled",
                        other
                    )))
                }
            }
        }
        Ok(registry)
    }

    /// Registers a driver under its own name.
    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    /// Looks up a driver by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Driver>> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DriverNotFound(name.to_string()))
    }

    /// Registered driver names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered drivers.
    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    /// Returns true when no drivers are registered.
    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn registry_registers_builtins() {
        let enabled = vec!["ssh".to_string(), "http".to_string(), "sftp".to_string()];
        let registry = DriverRegistry::with_builtins(&enabled).unwrap();
        assert_eq!(registry.names(), vec!["http", "sftp", "ssh"]);
        assert!(registry.get("ssh").is_ok());
        assert!(registry.get("telnet").is_err());
    }

    #[test]
    fn registry_rejects_unknown_driver() {
        let enabled = vec!["carrier-pigeon".to_string()];
        assert!(DriverRegistry::with_builtins(&enabled).is_err());
    }

    #[test]
    fn signature_ignores_key_order() {
        let a = json!({"host": "10.0.0.1", "port": 22, "opts": {"x": 1, "y": 2}});
        let b = json!({"port": 22, "opts": {"y": 2, "x": 1}, "host": "10.0.0.1"});
        assert_eq!(args_signature(&a), args_signature(&b));

        let c = json!({"host": "10.0.0.2", "port": 22});
        assert_ne!(args_signature(&a), args_signature(&c));
    }

    #[test]
    fn driver_error_maps_into_taxonomy() {
        use crate::error::ErrorKind;

        let err = DriverError::ConnectFailed("refused".into()).into_error("ssh", "10.0.0.1");
        assert_eq!(err.kind(), ErrorKind::ConnectFailed);

        let err = DriverError::AuthFailed("bad password".into()).into_error("ssh", "10.0.0.1");
        assert_eq!(err.kind(), ErrorKind::AuthFailed);

        let err = DriverError::CommandFailed("% Invalid input".into()).into_error("ssh", "h");
        assert_eq!(err.kind(), ErrorKind::CommandFailed);

        let err = DriverError::Internal("boom".into()).into_error("ssh", "h");
        assert_eq!(err.kind(), ErrorKind::DriverInternal);
    }
}
