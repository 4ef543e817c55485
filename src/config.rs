//! Configuration module for NetPulse.
//!
//! Handles loading and merging configuration from multiple sources:
//! - Default values
//! - Configuration file (`netpulse.yaml` / `netpulse.toml`, or an explicit path)
//! - Environment variables (`NETPULSE_` prefix, `__` section separator)
//!
//! Every process kind (server, node worker, fifo worker, pinned worker)
//! loads the same [`Config`]; each reads the sections it needs.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::job::QueueStrategy;

/// Environment variable prefix for overrides (`NETPULSE_SERVER__PORT=9000`).
const ENV_PREFIX: &str = "NETPULSE";

/// Default configuration file stems probed in the working directory.
const DEFAULT_CONFIG_STEMS: &[&str] = &["netpulse.yaml", "netpulse.yml", "netpulse.toml"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP API settings
    pub server: ServerConfig,

    /// Redis connection settings
    pub redis: RedisConfig,

    /// Worker topology settings
    pub worker: WorkerConfig,

    /// Job lifecycle defaults
    pub job: JobConfig,

    /// Driver plugin settings
    pub drivers: DriversConfig,

    /// Logging settings
    pub log: LogConfig,
}

impl Config {
    /// Loads configuration from defaults, an optional file, and environment.
    ///
    /// When `path` is `None`, the default stems are probed in the working
    /// directory; a missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        match path {
            Some(explicit) => {
                builder = builder.add_source(config::File::from(explicit).required(true));
            }
            None => {
                for stem in DEFAULT_CONFIG_STEMS {
                    builder =
                        builder.add_source(config::File::with_name(stem).required(false));
                }
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))
    }
}

/// HTTP API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// API key required on every request; `None` disables authentication
    pub api_key: Option<String>,
    /// Request header carrying the API key
    pub api_key_header: String,
    /// Whether to allow cross-origin requests
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            api_key: None,
            api_key_header: "X-API-KEY".to_string(),
            enable_cors: false,
        }
    }
}

impl ServerConfig {
    /// Bind address string.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Redis connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis host
    pub host: String,
    /// Redis port
    pub port: u16,
    /// Optional password
    pub password: Option<String>,
    /// Database index
    pub db: u8,
    /// Whether to connect with TLS
    pub tls: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            db: 0,
            tls: false,
        }
    }
}

impl RedisConfig {
    /// Builds the connection URL for the redis crate.
    pub fn url(&self) -> String {
        let scheme = if self.tls { "rediss" } else { "redis" };
        match &self.password {
            Some(password) => format!(
                "{}://:{}@{}:{}/{}",
                scheme, password, self.host, self.port, self.db
            ),
            None => format!("{}://{}:{}/{}", scheme, self.host, self.port, self.db),
        }
    }
}

/// Worker topology settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Scheduler plugin used for pinned placement
    pub scheduler: String,

    /// Node identity; defaults to the machine hostname
    pub node_id: Option<String>,

    /// Node inventory entry TTL; heartbeats must arrive faster than this
    #[serde(with = "humantime_serde")]
    pub node_ttl: Duration,

    /// Maximum concurrent pinned workers per node
    pub pinned_per_node: usize,

    /// Consumer tasks per fifo-worker process
    pub fifo_concurrency: usize,

    /// Spawn attempts before surfacing `no_capacity`
    pub spawn_retries: u32,

    /// How long the dispatcher waits for a node worker's spawn reply
    #[serde(with = "humantime_serde")]
    pub spawn_reply_timeout: Duration,

    /// Blocking queue-pop timeout; bounds shutdown latency
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scheduler: "least_load".to_string(),
            node_id: None,
            node_ttl: Duration::from_secs(60),
            pinned_per_node: 32,
            fifo_concurrency: 8,
            spawn_retries: 3,
            spawn_reply_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    /// Resolves the node identity, falling back to the machine hostname.
    pub fn resolve_node_id(&self) -> String {
        if let Some(id) = &self.node_id {
            return id.clone();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "node-unknown".to_string())
    }

    /// Heartbeat interval derived from the node TTL.
    pub fn heartbeat_interval(&self) -> Duration {
        self.node_ttl / 3
    }
}

/// Job lifecycle defaults, all in seconds to match request payload units.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Queue-life TTL: a job not started within this window fails
    pub ttl: u64,
    /// Per-job execution timeout
    pub timeout: u64,
    /// Execution timeout for bulk submissions
    pub bulk_timeout: u64,
    /// Retention of terminal job records
    pub result_ttl: u64,
    /// Pinned worker idle TTL: exit voluntarily after this long without jobs
    pub idle_ttl: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            ttl: 1800,
            timeout: 300,
            bulk_timeout: 600,
            result_ttl: 3600,
            idle_ttl: 600,
        }
    }
}

/// Driver plugin settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriversConfig {
    /// Driver plugins to register; unknown names fail startup
    pub enabled: Vec<String>,

    /// Per-driver default queue strategy; drivers absent from this map
    /// default from their session-reuse capability
    pub queue_strategy: HashMap<String, QueueStrategy>,
}

impl Default for DriversConfig {
    fn default() -> Self {
        Self {
            enabled: vec!["ssh".to_string(), "http".to_string(), "sftp".to_string()],
            queue_strategy: HashMap::new(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter (overridden by `RUST_LOG`)
    pub level: String,
    /// Emit JSON-formatted log lines
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
