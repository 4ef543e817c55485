//! Shared state records exchanged through Redis.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One node's inventory entry under `netpulse:node_info_map`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInfo {
    /// Stable node identity
    pub id: String,
    /// Maximum concurrent pinned workers
    pub capacity: usize,
    /// Pinned workers currently alive on this node
    pub current_count: usize,
    /// Last heartbeat time
    pub last_heartbeat: DateTime<Utc>,
}

impl NodeInfo {
    /// Creates a fresh entry with a current heartbeat.
    pub fn new(id: impl Into<String>, capacity: usize) -> Self {
        Self {
            id: id.into(),
            capacity,
            current_count: 0,
            last_heartbeat: Utc::now(),
        }
    }

    /// Returns true while the heartbeat is younger than the node TTL.
    pub fn is_live(&self, node_ttl: std::time::Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.last_heartbeat);
        age.num_seconds() >= 0 && (age.num_seconds() as u64) < node_ttl.as_secs()
    }

    /// Remaining pinned-worker slots.
    pub fn spare_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.current_count)
    }
}

/// Descriptor of a live pinned worker, kept in its node's inventory hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PinnedWorkerDescriptor {
    /// Device host the worker is bound to
    pub host: String,
    /// Node hosting the worker process
    pub node_id: String,
    /// OS process id of the worker
    pub pid: u32,
    /// Pinned queue the worker consumes
    pub queue: String,
    /// Spawn time
    pub started_at: DateTime<Utc>,
}

/// A request delivered to a node worker's request list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeRequest {
    /// Spawn a pinned worker for a device.
    Spawn(SpawnRequest),
    /// Forcibly terminate the pinned worker for a device.
    Terminate {
        /// Correlates the reply list
        request_id: String,
        /// Device host whose worker should die
        host: String,
    },
}

/// Spawn request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    /// Correlates the reply list
    pub request_id: String,
    /// Device host to bind the new worker to
    pub host: String,
    /// Driver plugin name
    pub driver: String,
    /// Driver-specific connection arguments
    pub connection_args: serde_json::Value,
    /// Extra driver options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_args: Option<serde_json::Value>,
}

/// Reply to a [`NodeRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NodeReply {
    /// A worker was spawned; jobs may be enqueued on `queue`.
    Spawned {
        /// Pinned queue name for the device
        queue: String,
    },
    /// A worker for the host already exists on this node.
    AlreadyRunning {
        /// Pinned queue name for the device
        queue: String,
    },
    /// The node is at its pinned cap; the dispatcher should retry elsewhere.
    CapacityExhausted,
    /// The worker was terminated (terminate requests only).
    Terminated,
    /// No worker for the host exists on this node.
    NotFound,
    /// The request failed for another reason.
    Failed {
        /// Error message
        message: String,
    },
}

/// Boot payload stashed for a freshly spawned pinned worker.
///
/// Credentials never travel through argv; the child receives only the stash
/// key and consumes the payload exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootPayload {
    /// Device host
    pub host: String,
    /// Node identity of the spawner
    pub node_id: String,
    /// Driver plugin name
    pub driver: String,
    /// Driver-specific connection arguments
    pub connection_args: serde_json::Value,
    /// Extra driver options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_args: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn node_liveness_follows_ttl() {
        let mut node = NodeInfo::new("node-a", 4);
        let now = Utc::now();
        assert!(node.is_live(Duration::from_secs(60), now));

        node.last_heartbeat = now - chrono::Duration::seconds(61);
        assert!(!node.is_live(Duration::from_secs(60), now));
    }

    #[test]
    fn spare_capacity_never_underflows() {
        let mut node = NodeInfo::new("node-a", 2);
        node.current_count = 5;
        assert_eq!(node.spare_capacity(), 0);
    }

    #[test]
    fn node_request_wire_shape() {
        let request = NodeRequest::Spawn(SpawnRequest {
            request_id: "r1".to_string(),
            host: "10.0.0.1".to_string(),
            driver: "ssh".to_string(),
            connection_args: serde_json::json!({"host": "10.0.0.1"}),
            driver_args: None,
        });
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["kind"], "spawn");
        assert_eq!(json["host"], "10.0.0.1");

        let reply = NodeReply::CapacityExhausted;
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["outcome"], "capacity_exhausted");
    }
}
