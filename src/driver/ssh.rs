//! SSH CLI driver.
//!
//! Talks to network devices and Linux hosts over SSH using the russh crate.
//! This is the only built-in driver that supports persisted sessions: a
//! pinned worker keeps one [`SshSession`] open across jobs and the keepalive
//! probe (open and immediately close a channel) both exercises the transport
//! and resets the remote idle timer.
//!
//! Command failures on CLI devices are reported in-band rather than through
//! exit codes, so output is matched against error patterns (`% Invalid
//! input`, ...) in addition to checking the exit status.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use russh::client::{Handle, Handler};
use russh::keys::key::PublicKey;
use russh::keys::load_secret_key;
use russh::ChannelMsg;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use super::{deserialize_args, Driver, DriverError, DriverResult, Session};

/// Default SSH port.
const DEFAULT_PORT: u16 = 22;

/// Default connect timeout in seconds.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;

/// Default keepalive interval in seconds (0 = disabled).
const DEFAULT_KEEPALIVE_SECS: u64 = 30;

/// Default per-command timeout in seconds.
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;

/// Error patterns CLI devices print in-band with a zero exit status.
static DEVICE_ERROR_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"% ?Invalid input",
        r"% ?Incomplete command",
        r"% ?Ambiguous command",
        r"% ?Unknown command",
        r"% ?Bad secret",
        r"(?i)^syntax error",
        r"(?i)^error:",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid device error pattern"))
    .collect()
});

/// Connection arguments for the SSH driver.
#[derive(Debug, Clone, Deserialize)]
pub struct SshConnectionArgs {
    /// Target host or address
    pub host: String,
    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login user
    pub username: String,
    /// Password for password authentication (and key passphrase fallback)
    #[serde(default)]
    pub password: Option<String>,
    /// Path to a private key for public-key authentication
    #[serde(default)]
    pub private_key: Option<String>,
    /// Device family hint (`cisco_ios`, `linux`, ...), kept for fingerprints
    #[serde(default)]
    pub device_type: Option<String>,
    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub timeout: u64,
    /// Keepalive interval in seconds; 0 disables the monitor
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,
    /// Pinned server host key fingerprint; absent means accept-new
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
    /// Connect retries after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay between connect attempts in seconds, doubled per attempt
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_keepalive() -> u64 {
    DEFAULT_KEEPALIVE_SECS
}

fn default_max_retries() -> u32 {
    1
}

fn default_retry_delay() -> u64 {
    2
}

/// Backoff delay before retry attempt `attempt` (1-based).
fn retry_backoff(base_secs: u64, attempt: u32) -> Duration {
    Duration::from_secs(base_secs.saturating_mul(1u64 << attempt.saturating_sub(1).min(6)))
}

/// Extra options accepted through `driver_args`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SshDriverArgs {
    /// Additional in-band error patterns (regex)
    #[serde(default)]
    pub error_patterns: Vec<String>,
    /// Per-command timeout in seconds
    #[serde(default)]
    pub command_timeout: Option<u64>,
}

/// Russh handler error wrapper required by the `Handler` trait.
#[derive(Debug)]
pub struct HandlerError(pub russh::Error);

impl From<russh::Error> for HandlerError {
    fn from(err: russh::Error) -> Self {
        HandlerError(err)
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "russh error: {}", self.0)
    }
}

impl std::error::Error for HandlerError {}

/// Client-side SSH handler with optional host key pinning.
pub(crate) struct ClientHandler {
    host: String,
    pinned_fingerprint: Option<String>,
}

impl ClientHandler {
    fn new(host: &str, pinned_fingerprint: Option<String>) -> Self {
        Self {
            host: host.to_string(),
            pinned_fingerprint,
        }
    }
}

#[async_trait]
impl Handler for ClientHandler {
    type Error = HandlerError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match &self.pinned_fingerprint {
            Some(pinned) => {
                let actual = server_public_key.fingerprint();
                let expected = pinned.trim_start_matches("SHA256:");
                if actual.trim_start_matches("SHA256:") == expected {
                    debug!(host = %self.host, "Host key matched pinned fingerprint");
                    Ok(true)
                } else {
                    warn!(
                        host = %self.host,
                        "Host key fingerprint mismatch, rejecting connection"
                    );
                    Ok(false)
                }
            }
            None => {
                // accept-new: no fingerprint configured
                debug!(host = %self.host, "Accepting server host key");
                Ok(true)
            }
        }
    }
}

/// Opens and authenticates an SSH connection, retrying transient failures.
///
/// Shared with the SFTP driver, which runs the sftp subsystem over the same
/// kind of handle. Authentication rejections are not retried; waiting does
/// not make a bad credential good.
pub(crate) async fn open_handle(args: &SshConnectionArgs) -> DriverResult<Handle<ClientHandler>> {
    let mut last_error = None;

    for attempt in 0..=args.max_retries {
        if attempt > 0 {
            let delay = retry_backoff(args.retry_delay, attempt);
            debug!(host = %args.host, attempt = %attempt, delay = ?delay, "Retrying SSH connection");
            tokio::time::sleep(delay).await;
        }

        match do_connect(args).await {
            Ok(handle) => return Ok(handle),
            Err(e @ DriverError::AuthFailed(_)) => return Err(e),
            Err(e) => {
                warn!(host = %args.host, attempt = %attempt, error = %e, "SSH connection attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| DriverError::ConnectFailed("unknown connection error".to_string())))
}

/// Performs one connection attempt.
async fn do_connect(args: &SshConnectionArgs) -> DriverResult<Handle<ClientHandler>> {
    let timeout = Duration::from_secs(args.timeout);

    let mut config = russh::client::Config::default();
    // Idle detection belongs to the keepalive monitor, not the library.
    config.inactivity_timeout = None;
    config.preferred = russh::Preferred {
        kex: std::borrow::Cow::Borrowed(&[
            russh::kex::CURVE25519,
            russh::kex::CURVE25519_PRE_RFC_8731,
        ]),
        cipher: std::borrow::Cow::Borrowed(&[
            russh::cipher::CHACHA20_POLY1305,
            russh::cipher::AES_256_GCM,
        ]),
        key: std::borrow::Cow::Borrowed(&[
            russh::keys::key::ED25519,
            russh::keys::key::RSA_SHA2_256,
            russh::keys::key::RSA_SHA2_512,
        ]),
        mac: std::borrow::Cow::Borrowed(&[russh::mac::HMAC_SHA256, russh::mac::HMAC_SHA512]),
        compression: std::borrow::Cow::Borrowed(&[russh::compression::NONE]),
    };
    let config = Arc::new(config);

    let addr = format!("{}:{}", args.host, args.port);
    let socket = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr))
        .await
        .map_err(|_| DriverError::Timeout(args.timeout))?
        .map_err(|e| DriverError::ConnectFailed(format!("failed to connect to {}: {}", addr, e)))?;

    socket
        .set_nodelay(true)
        .map_err(|e| DriverError::ConnectFailed(format!("failed to set TCP_NODELAY: {}", e)))?;

    let handler = ClientHandler::new(&args.host, args.host_key_fingerprint.clone());
    let mut handle = russh::client::connect_stream(config, socket, handler)
        .await
        .map_err(|e| DriverError::ConnectFailed(format!("SSH handshake failed: {}", e)))?;

    authenticate(&mut handle, args).await?;

    debug!(host = %args.host, port = %args.port, user = %args.username, "SSH session established");
    Ok(handle)
}

/// Authenticates with a private key when configured, otherwise a password.
async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    args: &SshConnectionArgs,
) -> DriverResult<()> {
    if let Some(key_path) = &args.private_key {
        let key_pair = load_secret_key(key_path, args.password.as_deref())
            .map_err(|e| DriverError::AuthFailed(format!("failed to load key '{}': {}", key_path, e)))?;
        let authenticated = handle
            .authenticate_publickey(&args.username, Arc::new(key_pair))
            .await
            .map_err(|e| DriverError::AuthFailed(format!("public key auth failed: {}", e)))?;
        if authenticated {
            debug!(host = %args.host, "Authenticated using private key");
            return Ok(());
        }
        return Err(DriverError::AuthFailed(
            "device rejected public key".to_string(),
        ));
    }

    if let Some(password) = &args.password {
        let authenticated = handle
            .authenticate_password(&args.username, password)
            .await
            .map_err(|e| DriverError::AuthFailed(format!("password auth failed: {}", e)))?;
        if authenticated {
            debug!(host = %args.host, "Authenticated using password");
            return Ok(());
        }
        return Err(DriverError::AuthFailed(
            "device rejected credentials".to_string(),
        ));
    }

    Err(DriverError::AuthFailed(
        "no authentication method configured (need password or private_key)".to_string(),
    ))
}

/// Matches device output against the in-band error patterns.
///
/// Returns the first matching line, if any.
fn match_error_pattern<'a>(output: &'a str, extra: &[Regex]) -> Option<&'a str> {
    for line in output.lines() {
        let trimmed = line.trim();
        if DEVICE_ERROR_PATTERNS
            .iter()
            .chain(extra.iter())
            .any(|p| p.is_match(trimmed))
        {
            return Some(trimmed);
        }
    }
    None
}

/// The SSH driver plugin.
#[derive(Debug, Default)]
pub struct SshDriver;

impl SshDriver {
    /// Creates the driver.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for SshDriver {
    fn name(&self) -> &str {
        "ssh"
    }

    fn description(&self) -> &str {
        "Interactive SSH/CLI driver with persisted-session support"
    }

    fn supports_persistent_sessions(&self) -> bool {
        true
    }

    fn keepalive_interval(&self, args: &serde_json::Value) -> Duration {
        let secs = args
            .get("keepalive")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_KEEPALIVE_SECS);
        Duration::from_secs(secs)
    }

    fn validate_args(&self, args: &serde_json::Value) -> DriverResult<()> {
        deserialize_args::<SshConnectionArgs>(args).map(|_| ())
    }

    async fn connect(
        &self,
        args: &serde_json::Value,
        driver_args: Option<&serde_json::Value>,
    ) -> DriverResult<Box<dyn Session>> {
        let args: SshConnectionArgs = deserialize_args(args)?;
        let extra: SshDriverArgs = match driver_args {
            Some(value) => deserialize_args(value)?,
            None => SshDriverArgs::default(),
        };

        let mut extra_patterns = Vec::with_capacity(extra.error_patterns.len());
        for pattern in &extra.error_patterns {
            extra_patterns.push(
                Regex::new(pattern)
                    .map_err(|e| DriverError::InvalidArgs(format!("bad error pattern: {}", e)))?,
            );
        }

        let handle = open_handle(&args).await?;

        Ok(Box::new(SshSession {
            identifier: format!("{}@{}:{}", args.username, args.host, args.port),
            device_type: args.device_type.clone(),
            host: args.host,
            handle: Some(handle),
            extra_patterns,
            command_timeout: Duration::from_secs(
                extra.command_timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS),
            ),
        }))
    }
}

/// A live SSH session against one device.
pub struct SshSession {
    identifier: String,
    host: String,
    device_type: Option<String>,
    handle: Option<Handle<ClientHandler>>,
    extra_patterns: Vec<Regex>,
    command_timeout: Duration,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("identifier", &self.identifier)
            .field("connected", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

impl SshSession {
    fn handle(&self) -> DriverResult<&Handle<ClientHandler>> {
        self.handle
            .as_ref()
            .ok_or_else(|| DriverError::ConnectFailed("session is closed".to_string()))
    }

    /// Runs one command on a fresh exec channel and collects its output.
    async fn exec(&self, command: &str) -> DriverResult<(String, Option<u32>)> {
        let handle = self.handle()?;

        let run = async {
            let mut channel = handle.channel_open_session().await.map_err(|e| {
                DriverError::Internal(format!("failed to open channel: {}", e))
            })?;

            channel.exec(true, command).await.map_err(|e| {
                DriverError::Internal(format!("failed to execute command: {}", e))
            })?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut exit_code = None;

            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                    ChannelMsg::ExtendedData { ref data, ext } => {
                        if ext == 1 {
                            stderr.extend_from_slice(data);
                        }
                    }
                    ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }
            let _ = channel.eof().await;

            let mut output = String::from_utf8_lossy(&stdout).to_string();
            let stderr = String::from_utf8_lossy(&stderr);
            if !stderr.is_empty() {
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(&stderr);
            }

            trace!(command = %command, exit_code = ?exit_code, "Command completed");
            Ok((output, exit_code))
        };

        tokio::time::timeout(self.command_timeout, run)
            .await
            .map_err(|_| DriverError::Timeout(self.command_timeout.as_secs()))?
    }

    /// Runs one line, surfacing exit-code and in-band device errors.
    async fn run_checked(&self, line: &str) -> DriverResult<String> {
        let (output, exit_code) = self.exec(line).await?;

        if let Some(code) = exit_code {
            if code != 0 {
                return Err(DriverError::CommandFailed(format!(
                    "'{}' exited with status {}: {}",
                    line,
                    code,
                    output.trim()
                )));
            }
        }
        if let Some(matched) = match_error_pattern(&output, &self.extra_patterns) {
            return Err(DriverError::CommandFailed(format!(
                "'{}' rejected by device: {}",
                line, matched
            )));
        }
        Ok(output)
    }
}

#[async_trait]
impl Session for SshSession {
    async fn send(&mut self, commands: &[String]) -> DriverResult<serde_json::Value> {
        let mut results: IndexMap<String, String> = IndexMap::with_capacity(commands.len());
        for command in commands {
            let output = self.run_checked(command).await?;
            results.insert(command.clone(), output);
        }
        serde_json::to_value(results).map_err(|e| DriverError::Internal(e.to_string()))
    }

    async fn config(&mut self, lines: &[String]) -> DriverResult<serde_json::Value> {
        let mut acks = Vec::with_capacity(lines.len());
        for line in lines {
            let output = self.run_checked(line).await?;
            acks.push(serde_json::json!({
                "line": line,
                "output": output,
            }));
        }
        Ok(serde_json::Value::Array(acks))
    }

    async fn is_alive(&mut self) -> bool {
        match &self.handle {
            Some(handle) => !handle.is_closed(),
            None => false,
        }
    }

    async fn keepalive(&mut self) -> DriverResult<()> {
        let handle = self.handle()?;
        // Open and immediately close a channel: exercises the transport and
        // resets the device's idle timer without producing output.
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| DriverError::ConnectFailed(format!("keepalive failed: {}", e)))?;
        let _ = channel.eof().await;
        trace!(identifier = %self.identifier, "Sent keepalive");
        Ok(())
    }

    async fn disconnect(&mut self) -> DriverResult<()> {
        if let Some(handle) = self.handle.take() {
            let _ = handle
                .disconnect(
                    russh::Disconnect::ByApplication,
                    "Connection closed by client",
                    "en",
                )
                .await;
            debug!(identifier = %self.identifier, "SSH session closed");
        }
        Ok(())
    }

    fn fingerprint(&self) -> Option<String> {
        Some(match &self.device_type {
            Some(device_type) => format!("{} {}", device_type, self.host),
            None => format!("ssh {}", self.host),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn args_apply_defaults() {
        let args: SshConnectionArgs = deserialize_args(&json!({
            "host": "10.0.0.1",
            "username": "admin",
            "password": "secret",
        }))
        .unwrap();
        assert_eq!(args.port, 22);
        assert_eq!(args.timeout, 15);
        assert_eq!(args.keepalive, 30);
        assert_eq!(args.max_retries, 1);
        assert!(args.device_type.is_none());
    }

    #[test]
    fn retry_backoff_doubles_and_caps() {
        assert_eq!(retry_backoff(2, 1), Duration::from_secs(2));
        assert_eq!(retry_backoff(2, 2), Duration::from_secs(4));
        assert_eq!(retry_backoff(2, 3), Duration::from_secs(8));
        // The shift is capped, so pathological attempt counts cannot overflow.
        assert_eq!(retry_backoff(2, 64), Duration::from_secs(128));
    }

    #[test]
    fn args_require_host_and_username() {
        let missing_user: DriverResult<SshConnectionArgs> =
            deserialize_args(&json!({"host": "10.0.0.1"}));
        assert!(missing_user.is_err());
    }

    #[test]
    fn keepalive_interval_comes_from_args() {
        let driver = SshDriver::new();
        assert_eq!(
            driver.keepalive_interval(&json!({"keepalive": 5})),
            Duration::from_secs(5)
        );
        assert_eq!(
            driver.keepalive_interval(&json!({"keepalive": 0})),
            Duration::ZERO
        );
        assert_eq!(
            driver.keepalive_interval(&json!({})),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn device_error_patterns_match() {
        let output = "show verson\n% Invalid input detected at '^' marker.";
        assert!(match_error_pattern(output, &[]).is_some());

        let clean = "Cisco IOS XE Software, Version 17.03.04";
        assert!(match_error_pattern(clean, &[]).is_none());

        let extra = vec![Regex::new(r"COMMIT FAILED").unwrap()];
        assert!(match_error_pattern("COMMIT FAILED: bad vlan", &extra).is_some());
    }

    #[test]
    fn driver_is_session_reusing() {
        let driver = SshDriver::new();
        assert!(driver.supports_persistent_sessions());
        assert_eq!(driver.name(), "ssh");
    }
}
