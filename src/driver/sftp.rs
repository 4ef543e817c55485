//! SFTP batch transfer driver.
//!
//! Stateless driver for bulk file movement to and from Linux hosts. Each job
//! opens a fresh SSH connection and runs the sftp subsystem over it; a
//! long-running transfer must not hold a persisted session hostage, so these
//! jobs default to the fifo queue.
//!
//! Commands are transfer directives:
//!
//! - `put:<local>:<remote>` — upload a local file
//! - `get:<remote>:<local>` — download a remote file

use async_trait::async_trait;
use indexmap::IndexMap;
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::ssh::{open_handle, ClientHandler, SshConnectionArgs};
use super::{deserialize_args, Driver, DriverError, DriverResult, Session};

/// A parsed transfer directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferDirective {
    /// Upload `local` to `remote`
    Put {
        /// Source path on this machine
        local: String,
        /// Destination path on the device
        remote: String,
    },
    /// Download `remote` to `local`
    Get {
        /// Source path on the device
        remote: String,
        /// Destination path on this machine
        local: String,
    },
}

impl TransferDirective {
    /// Parses `put:<local>:<remote>` / `get:<remote>:<local>`.
    pub fn parse(raw: &str) -> DriverResult<Self> {
        let mut parts = raw.splitn(3, ':');
        let action = parts.next().unwrap_or_default();
        let first = parts.next();
        let second = parts.next();

        match (action, first, second) {
            ("put", Some(local), Some(remote)) if !local.is_empty() && !remote.is_empty() => {
                Ok(TransferDirective::Put {
                    local: local.to_string(),
                    remote: remote.to_string(),
                })
            }
            ("get", Some(remote), Some(local)) if !remote.is_empty() && !local.is_empty() => {
                Ok(TransferDirective::Get {
                    remote: remote.to_string(),
                    local: local.to_string(),
                })
            }
            _ => Err(DriverError::InvalidArgs(format!(
                "bad transfer directive '{}', expected put:<local>:<remote> or get:<remote>:<local>",
                raw
            ))),
        }
    }
}

/// The SFTP driver plugin.
#[derive(Debug, Default)]
pub struct SftpDriver;

impl SftpDriver {
    /// Creates the driver.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Driver for SftpDriver {
    fn name(&self) -> &str {
        "sftp"
    }

    fn description(&self) -> &str {
        "Stateless SFTP batch transfer driver"
    }

    fn validate_args(&self, args: &serde_json::Value) -> DriverResult<()> {
        deserialize_args::<SshConnectionArgs>(args).map(|_| ())
    }

    async fn connect(
        &self,
        args: &serde_json::Value,
        _driver_args: Option<&serde_json::Value>,
    ) -> DriverResult<Box<dyn Session>> {
        let args: SshConnectionArgs = deserialize_args(args)?;
        let handle = open_handle(&args).await?;

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| DriverError::Transfer(format!("failed to open channel: {}", e)))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| {
                DriverError::Transfer(format!("failed to request SFTP subsystem: {}", e))
            })?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| DriverError::Transfer(format!("failed to create SFTP session: {}", e)))?;

        debug!(host = %args.host, "SFTP session established");

        Ok(Box::new(SftpBatchSession {
            identifier: format!("sftp {}", args.host),
            handle: Some(handle),
            sftp: Some(sftp),
        }))
    }
}

/// A transient SFTP session for one batch of transfers.
pub struct SftpBatchSession {
    identifier: String,
    handle: Option<russh::client::Handle<ClientHandler>>,
    sftp: Option<SftpSession>,
}

impl std::fmt::Debug for SftpBatchSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpBatchSession")
            .field("identifier", &self.identifier)
            .field("connected", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

impl SftpBatchSession {
    fn sftp(&self) -> DriverResult<&SftpSession> {
        self.sftp
            .as_ref()
            .ok_or_else(|| DriverError::ConnectFailed("session is closed".to_string()))
    }

    /// Uploads one local file; returns bytes written.
    async fn put(&self, local: &str, remote: &str) -> DriverResult<u64> {
        let data = tokio::fs::read(local)
            .await
            .map_err(|e| DriverError::Transfer(format!("failed to read '{}': {}", local, e)))?;

        let mut file = self
            .sftp()?
            .create(remote)
            .await
            .map_err(|e| DriverError::Transfer(format!("failed to create '{}': {}", remote, e)))?;
        file.write_all(&data)
            .await
            .map_err(|e| DriverError::Transfer(format!("failed to write '{}': {}", remote, e)))?;
        file.shutdown()
            .await
            .map_err(|e| DriverError::Transfer(format!("failed to flush '{}': {}", remote, e)))?;

        Ok(data.len() as u64)
    }

    /// Downloads one remote file; returns bytes read.
    async fn get(&self, remote: &str, local: &str) -> DriverResult<u64> {
        let mut file = self
            .sftp()?
            .open(remote)
            .await
            .map_err(|e| DriverError::Transfer(format!("failed to open '{}': {}", remote, e)))?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .await
            .map_err(|e| DriverError::Transfer(format!("failed to read '{}': {}", remote, e)))?;

        tokio::fs::write(local, &data)
            .await
            .map_err(|e| DriverError::Transfer(format!("failed to write '{}': {}", local, e)))?;

        Ok(data.len() as u64)
    }
}

#[async_trait]
impl Session for SftpBatchSession {
    async fn send(&mut self, commands: &[String]) -> DriverResult<serde_json::Value> {
        let mut results: IndexMap<String, serde_json::Value> =
            IndexMap::with_capacity(commands.len());
        for command in commands {
            let directive = TransferDirective::parse(command)?;
            let (action, bytes) = match &directive {
                TransferDirective::Put { local, remote } => ("put", self.put(local, remote).await?),
                TransferDirective::Get { remote, local } => ("get", self.get(remote, local).await?),
            };
            results.insert(
                command.clone(),
                serde_json::json!({"action": action, "bytes": bytes}),
            );
        }
        serde_json::to_value(results).map_err(|e| DriverError::Internal(e.to_string()))
    }

    async fn config(&mut self, _lines: &[String]) -> DriverResult<serde_json::Value> {
        Err(DriverError::Unsupported(
            "sftp driver does not accept configuration pushes".to_string(),
        ))
    }

    async fn is_alive(&mut self) -> bool {
        match &self.handle {
            Some(handle) => !handle.is_closed(),
            None => false,
        }
    }

    async fn keepalive(&mut self) -> DriverResult<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> DriverResult<()> {
        if let Some(sftp) = self.sftp.take() {
            let _ = sftp.close().await;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle
                .disconnect(
                    russh::Disconnect::ByApplication,
                    "Connection closed by client",
                    "en",
                )
                .await;
            debug!(identifier = %self.identifier, "SFTP session closed");
        }
        Ok(())
    }

    fn fingerprint(&self) -> Option<String> {
        Some(self.identifier.clone())
    }
}
