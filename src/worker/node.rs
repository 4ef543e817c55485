//! The node worker: per-node supervisor for pinned workers.
//!
//! Exactly one node worker runs per compute node. It owns the node's
//! inventory entry (registration + heartbeat), is the sole authority on the
//! node's pinned capacity, spawns pinned worker processes on request, reaps
//! them on exit, and cleans up descriptors and bindings they leave behind.
//!
//! Requests arrive over a Redis list; because the node worker is the only
//! consumer of its own request list, capacity decisions are serialized and
//! an over-cap spawn can never slip through a stale scheduler snapshot.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::Result;
use crate::job::pinned_queue_name;
use crate::store::{
    BootPayload, NodeInfo, NodeReply, NodeRequest, PinnedWorkerDescriptor, RedisStore,
    SpawnRequest,
};

/// Grace period between SIGTERM and SIGKILL at shutdown.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// A live child tracked by the supervisor.
#[derive(Debug, Clone)]
struct ChildRecord {
    pid: u32,
    queue: String,
}

/// Decision for an incoming spawn request, separated from IO for testing.
#[derive(Debug, PartialEq, Eq)]
enum SpawnDecision {
    /// Worker already serves this host.
    AlreadyRunning(String),
    /// Node is at its pinned cap.
    AtCapacity,
    /// Go ahead and fork.
    Spawn,
}

fn spawn_decision(
    existing_queue: Option<String>,
    child_count: usize,
    capacity: usize,
) -> SpawnDecision {
    if let Some(queue) = existing_queue {
        return SpawnDecision::AlreadyRunning(queue);
    }
    if child_count >= capacity {
        return SpawnDecision::AtCapacity;
    }
    SpawnDecision::Spawn
}

/// The per-node supervisor process.
pub struct NodeWorker {
    store: RedisStore,
    config: Arc<Config>,
    node_id: String,
    capacity: usize,
    children: Arc<DashMap<String, ChildRecord>>,
    cancel: CancellationToken,
}

impl NodeWorker {
    /// Creates the supervisor for this machine.
    pub fn new(store: RedisStore, config: Arc<Config>, cancel: CancellationToken) -> Self {
        let node_id = config.worker.resolve_node_id();
        let capacity = config.worker.pinned_per_node;
        Self {
            store,
            config,
            node_id,
            capacity,
            children: Arc::new(DashMap::new()),
            cancel,
        }
    }

    /// Node identity in the inventory.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Runs the supervisor until shutdown.
    pub async fn run(self) -> Result<()> {
        info!(
            node_id = %self.node_id,
            capacity = %self.capacity,
            "Node worker starting"
        );

        self.publish_inventory().await?;

        let heartbeat = tokio::spawn(heartbeat_loop(
            self.store.clone(),
            self.node_id.clone(),
            self.capacity,
            self.children.clone(),
            self.config.worker.heartbeat_interval(),
            self.cancel.clone(),
        ));

        let served = self.serve().await;

        self.cancel.cancel();
        let _ = heartbeat.await;

        self.shutdown().await;

        info!(node_id = %self.node_id, "Node worker exited");
        served
    }

    /// Writes the node's current inventory entry.
    async fn publish_inventory(&self) -> Result<()> {
        let mut info = NodeInfo::new(&self.node_id, self.capacity);
        info.current_count = self.children.len();
        self.store.put_node(&info).await
    }

    /// Request loop: spawn and terminate requests from dispatchers.
    async fn serve(&self) -> Result<()> {
        let poll = self.config.worker.poll_interval;

        loop {
            let request = tokio::select! {
                _ = self.cancel.cancelled() => break,
                request = self.store.pop_node_request(&self.node_id, poll) => request?,
            };

            let Some(request) = request else { continue };

            match request {
                NodeRequest::Spawn(spawn) => {
                    let request_id = spawn.request_id.clone();
                    let reply = match self.handle_spawn(spawn).await {
                        Ok(reply) => reply,
                        Err(e) => NodeReply::Failed {
                            message: e.to_string(),
                        },
                    };
                    self.store.send_reply(&request_id, &reply).await?;
                }
                NodeRequest::Terminate { request_id, host } => {
                    let reply = self.handle_terminate(&host);
                    self.store.send_reply(&request_id, &reply).await?;
                }
            }
        }

        Ok(())
    }

    /// Handles one spawn request; the capacity check happens here, on the
    /// capacity authority, not in the scheduler.
    async fn handle_spawn(&self, request: SpawnRequest) -> Result<NodeReply> {
        let existing = self
            .children
            .get(&request.host)
            .map(|child| child.queue.clone());

        match spawn_decision(existing, self.children.len(), self.capacity) {
            SpawnDecision::AlreadyRunning(queue) => {
                debug!(node_id = %self.node_id, host = %request.host, "Worker already running");
                return Ok(NodeReply::AlreadyRunning { queue });
            }
            SpawnDecision::AtCapacity => {
                warn!(
                    node_id = %self.node_id,
                    host = %request.host,
                    capacity = %self.capacity,
                    "Rejecting spawn, node at capacity"
                );
                return Ok(NodeReply::CapacityExhausted);
            }
            SpawnDecision::Spawn => {}
        }

        let queue = pinned_queue_name(&request.host);
        let worker_id = Uuid::new_v4().to_string();

        self.store
            .stash_boot_payload(
                &worker_id,
                &BootPayload {
                    host: request.host.clone(),
                    node_id: self.node_id.clone(),
                    driver: request.driver.clone(),
                    connection_args: request.connection_args.clone(),
                    driver_args: request.driver_args.clone(),
                },
            )
            .await?;

        let exe = std::env::current_exe()?;
        let child = tokio::process::Command::new(exe)
            .arg("pinned-worker")
            .arg("--boot-key")
            .arg(&worker_id)
            .stdin(Stdio::null())
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                error!(node_id = %self.node_id, host = %request.host, error = %e, "Fork failed");
                return Ok(NodeReply::Failed {
                    message: format!("failed to fork pinned worker: {}", e),
                });
            }
        };

        let pid = child.id().unwrap_or_default();
        info!(
            node_id = %self.node_id,
            host = %request.host,
            pid = %pid,
            queue = %queue,
            "Spawned pinned worker"
        );

        self.children.insert(
            request.host.clone(),
            ChildRecord {
                pid,
                queue: queue.clone(),
            },
        );

        // Provisional descriptor; the child refreshes it on startup.
        self.store
            .put_descriptor(&PinnedWorkerDescriptor {
                host: request.host.clone(),
                node_id: self.node_id.clone(),
                pid,
                queue: queue.clone(),
                started_at: chrono::Utc::now(),
            })
            .await?;
        self.publish_inventory().await?;

        // Reaper: waits for the child and cleans up whatever it left behind.
        let store = self.store.clone();
        let children = self.children.clone();
        let node_id = self.node_id.clone();
        let capacity = self.capacity;
        let host = request.host;
        tokio::spawn(async move {
            let status = child.wait().await;
            info!(node_id = %node_id, host = %host, status = ?status.ok(), "Reaped pinned worker");

            children.remove(&host);
            if let Err(e) = store.remove_descriptor(&node_id, &host).await {
                warn!(host = %host, error = %e, "Failed to remove descriptor on reap");
            }
            if let Err(e) = store.unbind_host_if(&host, &node_id).await {
                warn!(host = %host, error = %e, "Failed to remove binding on reap");
            }
            let mut info = NodeInfo::new(&node_id, capacity);
            info.current_count = children.len();
            if let Err(e) = store.put_node(&info).await {
                warn!(node_id = %node_id, error = %e, "Failed to refresh inventory on reap");
            }
        });

        Ok(NodeReply::Spawned { queue })
    }

    /// Handles a forcible termination request; the reaper does the cleanup.
    fn handle_terminate(&self, host: &str) -> NodeReply {
        match self.children.get(host) {
            Some(child) => {
                info!(node_id = %self.node_id, host = %host, pid = %child.pid, "Terminating pinned worker");
                signal_pid(child.pid, Signal::SIGTERM);
                NodeReply::Terminated
            }
            None => NodeReply::NotFound,
        }
    }

    /// Terminates children and clears the node's shared state.
    async fn shutdown(&self) {
        if !self.children.is_empty() {
            info!(
                node_id = %self.node_id,
                children = %self.children.len(),
                "Terminating pinned workers"
            );
            for child in self.children.iter() {
                signal_pid(child.pid, Signal::SIGTERM);
            }
            tokio::time::sleep(TERMINATE_GRACE).await;
            for child in self.children.iter() {
                signal_pid(child.pid, Signal::SIGKILL);
            }
        }

        if let Err(e) = self.store.clear_descriptors(&self.node_id).await {
            warn!(node_id = %self.node_id, error = %e, "Failed to clear descriptors");
        }
        if let Err(e) = self.store.remove_node(&self.node_id).await {
            warn!(node_id = %self.node_id, error = %e, "Failed to deregister node");
        }
    }
}

/// Sends a signal to a pid, logging failures only.
fn signal_pid(pid: u32, signal: Signal) {
    if pid == 0 {
        return;
    }
    if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
        debug!(pid = %pid, signal = %signal, error = %e, "Signal delivery failed");
    }
}

/// Refreshes the node's inventory entry faster than the node TTL expires it.
async fn heartbeat_loop(
    store: RedisStore,
    node_id: String,
    capacity: usize,
    children: Arc<DashMap<String, ChildRecord>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    debug!(node_id = %node_id, interval_secs = %interval.as_secs(), "Heartbeat started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let mut info = NodeInfo::new(&node_id, capacity);
        info.current_count = children.len();
        if let Err(e) = store.put_node(&info).await {
            warn!(node_id = %node_id, error = %e, "Heartbeat write failed");
        }
    }

    debug!(node_id = %node_id, "Heartbeat stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_decision_prefers_existing_worker() {
        assert_eq!(
            spawn_decision(Some("pinned_10.0.0.1".to_string()), 3, 4),
            SpawnDecision::AlreadyRunning("pinned_10.0.0.1".to_string())
        );
    }

    #[test]
    fn spawn_decision_enforces_capacity() {
        assert_eq!(spawn_decision(None, 4, 4), SpawnDecision::AtCapacity);
        assert_eq!(spawn_decision(None, 5, 4), SpawnDecision::AtCapacity);
        assert_eq!(spawn_decision(None, 0, 0), SpawnDecision::AtCapacity);
    }

    #[test]
    fn spawn_decision_allows_below_capacity() {
        assert_eq!(spawn_decision(None, 3, 4), SpawnDecision::Spawn);
        assert_eq!(spawn_decision(None, 0, 1), SpawnDecision::Spawn);
    }
}
