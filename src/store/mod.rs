//! Redis state store.
//!
//! Redis is the only shared store in the system: queues, job records, the
//! host→node binding map, node inventory, per-node worker descriptors, and
//! the spawn request/reply channels all live here. Every process holds one
//! [`RedisStore`] built on a multiplexed [`ConnectionManager`] that
//! reconnects transparently.
//!
//! Mutations that can race across processes (binding writes, queued-job
//! removal) use set-if-absent and list-remove primitives so the losers
//! observe the winner instead of corrupting state.

pub mod keys;
pub mod types;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use crate::config::RedisConfig;
use crate::error::{Error, JobError, Result};
use crate::job::{Job, JobRequest, JobStatus};

pub use types::{
    BootPayload, NodeInfo, NodeReply, NodeRequest, PinnedWorkerDescriptor, SpawnRequest,
};

/// How long a reply list lingers if the requester never collects it.
const REPLY_TTL_SECS: i64 = 60;

/// How long a boot payload stash survives if the child never starts.
const BOOT_TTL_SECS: u64 = 120;

/// Handle to the shared Redis state.
///
/// Cheap to clone; all clones share one multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connects to Redis using the configured URL.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url())?;
        let manager = client.get_connection_manager().await?;
        debug!(host = %config.host, port = %config.port, "Connected to Redis");
        Ok(Self { manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Round-trip liveness probe.
    pub async fn ping(&self) -> Result<()> {
        redis::cmd("PING")
            .query_async::<_, String>(&mut self.conn())
            .await?;
        Ok(())
    }

    // ========================================================================
    // Queues
    // ========================================================================

    /// Appends a job id to the tail of a queue.
    pub async fn enqueue(&self, queue: &str, job_id: &str) -> Result<()> {
        self.conn()
            .rpush::<_, _, ()>(keys::queue(queue), job_id)
            .await?;
        Ok(())
    }

    /// Blocking pop from the head of a queue.
    ///
    /// Returns `None` when the timeout elapses without a job; callers loop
    /// on this so shutdown signals are observed between pops.
    pub async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>> {
        let popped: Option<(String, String)> = self
            .conn()
            .blpop(keys::queue(queue), timeout.as_secs_f64())
            .await?;
        Ok(popped.map(|(_, id)| id))
    }

    /// Removes a still-queued job id from its queue.
    ///
    /// Returns true if the id was present (and is now removed); false means
    /// some worker already claimed it.
    pub async fn remove_queued(&self, queue: &str, job_id: &str) -> Result<bool> {
        let removed: isize = self
            .conn()
            .lrem(keys::queue(queue), 0, job_id)
            .await?;
        Ok(removed > 0)
    }

    /// Current depth of a queue.
    pub async fn queue_len(&self, queue: &str) -> Result<usize> {
        let len: usize = self.conn().llen(keys::queue(queue)).await?;
        Ok(len)
    }

    // ========================================================================
    // Job records
    // ========================================================================

    /// Writes a complete job record.
    pub async fn put_job(&self, job: &Job) -> Result<()> {
        let key = keys::job(&job.id);
        let mut fields: Vec<(&str, String)> = vec![
            ("payload", serde_json::to_string(&job.request)?),
            ("queue", job.queue.clone()),
            ("status", job.status.to_string()),
            ("created_at", job.created_at.to_rfc3339()),
            (
                "cancel_requested",
                if job.cancel_requested { "1" } else { "0" }.to_string(),
            ),
        ];
        if let Some(started_at) = job.started_at {
            fields.push(("started_at", started_at.to_rfc3339()));
        }
        if let Some(ended_at) = job.ended_at {
            fields.push(("ended_at", ended_at.to_rfc3339()));
        }
        if let Some(result) = &job.result {
            fields.push(("result", serde_json::to_string(result)?));
        }
        if let Some(error) = &job.error {
            fields.push(("error", serde_json::to_string(error)?));
        }
        if let Some(timeout_secs) = job.timeout_secs {
            fields.push(("timeout", timeout_secs.to_string()));
        }
        self.conn().hset_multiple::<_, _, _, ()>(key, &fields).await?;
        Ok(())
    }

    /// Loads a job record by id.
    pub async fn load_job(&self, id: &str) -> Result<Option<Job>> {
        let raw: HashMap<String, String> = self.conn().hgetall(keys::job(id)).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self::job_from_fields(id, &raw)?))
    }

    fn job_from_fields(id: &str, raw: &HashMap<String, String>) -> Result<Job> {
        let payload = raw
            .get("payload")
            .ok_or_else(|| Error::Internal(format!("job '{}' record missing payload", id)))?;
        let request: JobRequest = serde_json::from_str(payload)?;

        let status: JobStatus = raw
            .get("status")
            .ok_or_else(|| Error::Internal(format!("job '{}' record missing status", id)))?
            .parse()?;

        let parse_time = |field: &str| -> Result<Option<DateTime<Utc>>> {
            match raw.get(field) {
                None => Ok(None),
                Some(v) => DateTime::parse_from_rfc3339(v)
                    .map(|t| Some(t.with_timezone(&Utc)))
                    .map_err(|e| {
                        Error::Internal(format!("job '{}' bad {} timestamp: {}", id, field, e))
                    }),
            }
        };

        Ok(Job {
            id: id.to_string(),
            queue: raw.get("queue").cloned().unwrap_or_default(),
            request,
            status,
            created_at: parse_time("created_at")?
                .ok_or_else(|| Error::Internal(format!("job '{}' missing created_at", id)))?,
            started_at: parse_time("started_at")?,
            ended_at: parse_time("ended_at")?,
            result: raw
                .get("result")
                .map(|v| serde_json::from_str(v))
                .transpose()?,
            error: raw
                .get("error")
                .map(|v| serde_json::from_str(v))
                .transpose()?,
            timeout_secs: raw.get("timeout").and_then(|v| v.parse().ok()),
            cancel_requested: raw.get("cancel_requested").map(String::as_str) == Some("1"),
        })
    }

    /// Marks a claimed job started.
    pub async fn mark_job_started(&self, id: &str) -> Result<()> {
        let fields = [
            ("status", JobStatus::Started.to_string()),
            ("started_at", Utc::now().to_rfc3339()),
        ];
        self.conn()
            .hset_multiple::<_, _, _, ()>(keys::job(id), &fields)
            .await?;
        Ok(())
    }

    /// Writes a terminal state and schedules record expiry.
    pub async fn complete_job(
        &self,
        id: &str,
        status: JobStatus,
        result: Option<&serde_json::Value>,
        error: Option<&JobError>,
        result_ttl: Duration,
    ) -> Result<()> {
        let key = keys::job(id);
        let mut fields = vec![
            ("status", status.to_string()),
            ("ended_at", Utc::now().to_rfc3339()),
        ];
        if let Some(result) = result {
            fields.push(("result", serde_json::to_string(result)?));
        }
        if let Some(error) = error {
            fields.push(("error", serde_json::to_string(error)?));
        }
        self.conn()
            .hset_multiple::<_, _, _, ()>(&key, &fields)
            .await?;
        self.conn()
            .expire::<_, ()>(&key, result_ttl.as_secs() as i64)
            .await?;
        Ok(())
    }

    /// Scans the ids of all currently retained job records.
    ///
    /// Cursor-based, so large deployments do not block Redis the way KEYS
    /// would.
    pub async fn list_job_ids(&self) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let prefix = keys::job("");
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut ids = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            ids.extend(
                batch
                    .into_iter()
                    .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string)),
            );
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(ids)
    }

    /// Sets the cooperative cancellation flag on a job record.
    pub async fn request_cancel(&self, id: &str) -> Result<()> {
        self.conn()
            .hset::<_, _, _, ()>(keys::job(id), "cancel_requested", "1")
            .await?;
        Ok(())
    }

    /// Reads only the cancellation flag.
    pub async fn cancel_requested(&self, id: &str) -> Result<bool> {
        let flag: Option<String> = self
            .conn()
            .hget(keys::job(id), "cancel_requested")
            .await?;
        Ok(flag.as_deref() == Some("1"))
    }

    // ========================================================================
    // Host -> node bindings
    // ========================================================================

    /// Records a binding if none exists. Returns true when this caller won.
    pub async fn bind_host(&self, host: &str, node_id: &str) -> Result<bool> {
        let won: bool = self
            .conn()
            .hset_nx(keys::HOST_TO_NODE_MAP, host, node_id)
            .await?;
        Ok(won)
    }

    /// Reads the current binding for a host.
    pub async fn get_binding(&self, host: &str) -> Result<Option<String>> {
        let node: Option<String> = self.conn().hget(keys::HOST_TO_NODE_MAP, host).await?;
        Ok(node)
    }

    /// Removes a binding unconditionally.
    pub async fn unbind_host(&self, host: &str) -> Result<()> {
        self.conn()
            .hdel::<_, _, ()>(keys::HOST_TO_NODE_MAP, host)
            .await?;
        Ok(())
    }

    /// Removes a binding only while it still points at the given node.
    ///
    /// Read-then-delete; the narrow race with a concurrent rebind is
    /// tolerated because stale bindings are re-verified on next submission.
    pub async fn unbind_host_if(&self, host: &str, node_id: &str) -> Result<bool> {
        match self.get_binding(host).await? {
            Some(current) if current == node_id => {
                self.unbind_host(host).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Full snapshot of the binding map.
    pub async fn list_bindings(&self) -> Result<HashMap<String, String>> {
        let map: HashMap<String, String> = self.conn().hgetall(keys::HOST_TO_NODE_MAP).await?;
        Ok(map)
    }

    // ========================================================================
    // Node inventory
    // ========================================================================

    /// Writes a node's inventory entry (registration and heartbeat).
    pub async fn put_node(&self, node: &NodeInfo) -> Result<()> {
        self.conn()
            .hset::<_, _, _, ()>(keys::NODE_INFO_MAP, &node.id, serde_json::to_string(node)?)
            .await?;
        Ok(())
    }

    /// Removes a node's inventory entry.
    pub async fn remove_node(&self, node_id: &str) -> Result<()> {
        self.conn()
            .hdel::<_, _, ()>(keys::NODE_INFO_MAP, node_id)
            .await?;
        Ok(())
    }

    /// Reads one node entry.
    pub async fn get_node(&self, node_id: &str) -> Result<Option<NodeInfo>> {
        let raw: Option<String> = self.conn().hget(keys::NODE_INFO_MAP, node_id).await?;
        raw.map(|v| serde_json::from_str(&v).map_err(Error::from))
            .transpose()
    }

    /// Reads all node entries, live or not.
    pub async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let raw: HashMap<String, String> = self.conn().hgetall(keys::NODE_INFO_MAP).await?;
        let mut nodes = Vec::with_capacity(raw.len());
        for value in raw.values() {
            nodes.push(serde_json::from_str(value)?);
        }
        Ok(nodes)
    }

    // ========================================================================
    // Pinned-worker descriptors
    // ========================================================================

    /// Records a descriptor in its node's inventory hash.
    pub async fn put_descriptor(&self, descriptor: &PinnedWorkerDescriptor) -> Result<()> {
        self.conn()
            .hset::<_, _, _, ()>(
                keys::node_workers(&descriptor.node_id),
                &descriptor.host,
                serde_json::to_string(descriptor)?,
            )
            .await?;
        Ok(())
    }

    /// Removes a descriptor.
    pub async fn remove_descriptor(&self, node_id: &str, host: &str) -> Result<()> {
        self.conn()
            .hdel::<_, _, ()>(keys::node_workers(node_id), host)
            .await?;
        Ok(())
    }

    /// Reads the descriptor for one host on one node.
    pub async fn get_descriptor(
        &self,
        node_id: &str,
        host: &str,
    ) -> Result<Option<PinnedWorkerDescriptor>> {
        let raw: Option<String> = self.conn().hget(keys::node_workers(node_id), host).await?;
        raw.map(|v| serde_json::from_str(&v).map_err(Error::from))
            .transpose()
    }

    /// Reads all descriptors owned by one node.
    pub async fn list_descriptors(&self, node_id: &str) -> Result<Vec<PinnedWorkerDescriptor>> {
        let raw: HashMap<String, String> =
            self.conn().hgetall(keys::node_workers(node_id)).await?;
        let mut descriptors = Vec::with_capacity(raw.len());
        for value in raw.values() {
            descriptors.push(serde_json::from_str(value)?);
        }
        Ok(descriptors)
    }

    /// Drops a node's entire descriptor hash (shutdown cleanup).
    pub async fn clear_descriptors(&self, node_id: &str) -> Result<()> {
        self.conn()
            .del::<_, ()>(keys::node_workers(node_id))
            .await?;
        Ok(())
    }

    // ========================================================================
    // Node request / reply channels
    // ========================================================================

    /// Delivers a request to a node worker.
    pub async fn send_node_request(&self, node_id: &str, request: &NodeRequest) -> Result<()> {
        self.conn()
            .rpush::<_, _, ()>(keys::node_requests(node_id), serde_json::to_string(request)?)
            .await?;
        Ok(())
    }

    /// Blocking pop of the next request addressed to a node worker.
    pub async fn pop_node_request(
        &self,
        node_id: &str,
        timeout: Duration,
    ) -> Result<Option<NodeRequest>> {
        let popped: Option<(String, String)> = self
            .conn()
            .blpop(keys::node_requests(node_id), timeout.as_secs_f64())
            .await?;
        popped
            .map(|(_, raw)| serde_json::from_str(&raw).map_err(Error::from))
            .transpose()
    }

    /// Publishes the reply for a request id.
    pub async fn send_reply(&self, request_id: &str, reply: &NodeReply) -> Result<()> {
        let key = keys::reply(request_id);
        self.conn()
            .rpush::<_, _, ()>(&key, serde_json::to_string(reply)?)
            .await?;
        self.conn().expire::<_, ()>(&key, REPLY_TTL_SECS).await?;
        Ok(())
    }

    /// Waits for the reply to a request id.
    pub async fn await_reply(
        &self,
        request_id: &str,
        timeout: Duration,
    ) -> Result<Option<NodeReply>> {
        let popped: Option<(String, String)> = self
            .conn()
            .blpop(keys::reply(request_id), timeout.as_secs_f64())
            .await?;
        popped
            .map(|(_, raw)| serde_json::from_str(&raw).map_err(Error::from))
            .transpose()
    }

    // ========================================================================
    // Boot payload stash
    // ========================================================================

    /// Stashes a single-use boot payload for a spawning worker.
    pub async fn stash_boot_payload(&self, worker_id: &str, payload: &BootPayload) -> Result<()> {
        self.conn()
            .set_ex::<_, _, ()>(
                keys::worker_boot(worker_id),
                serde_json::to_string(payload)?,
                BOOT_TTL_SECS,
            )
            .await?;
        Ok(())
    }

    /// Consumes a boot payload; the stash is deleted atomically with the read.
    pub async fn take_boot_payload(&self, worker_id: &str) -> Result<Option<BootPayload>> {
        let raw: Option<String> = redis::cmd("GETDEL")
            .arg(keys::worker_boot(worker_id))
            .query_async(&mut self.conn())
            .await?;
        raw.map(|v| serde_json::from_str(&v).map_err(Error::from))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::FIFO_QUEUE;
    use serde_json::json;

    fn sample_job() -> Job {
        let request: JobRequest = serde_json::from_value(json!({
            "driver": "ssh",
            "connection_args": {"host": "10.0.0.1", "username": "u", "password": "p"},
            "command": "show version",
        }))
        .unwrap();
        Job::new(FIFO_QUEUE, request)
    }

    #[test]
    fn job_fields_round_trip_through_hash_encoding() {
        let mut job = sample_job();
        job.mark_started();
        job.mark_finished(json!({"show version": "ok"}));

        // Mirror of put_job's field layout.
        let mut raw = HashMap::new();
        raw.insert(
            "payload".to_string(),
            serde_json::to_string(&job.request).unwrap(),
        );
        raw.insert("queue".to_string(), job.queue.clone());
        raw.insert("status".to_string(), job.status.to_string());
        raw.insert("created_at".to_string(), job.created_at.to_rfc3339());
        raw.insert(
            "started_at".to_string(),
            job.started_at.unwrap().to_rfc3339(),
        );
        raw.insert("ended_at".to_string(), job.ended_at.unwrap().to_rfc3339());
        raw.insert(
            "result".to_string(),
            serde_json::to_string(job.result.as_ref().unwrap()).unwrap(),
        );
        raw.insert("cancel_requested".to_string(), "0".to_string());

        let loaded = RedisStore::job_from_fields(&job.id, &raw).unwrap();
        assert_eq!(loaded.status, JobStatus::Finished);
        assert_eq!(loaded.queue, FIFO_QUEUE);
        assert_eq!(loaded.result, job.result);
        assert!(!loaded.cancel_requested);
    }

    #[test]
    fn job_from_fields_rejects_missing_payload() {
        let mut raw = HashMap::new();
        raw.insert("status".to_string(), "queued".to_string());
        assert!(RedisStore::job_from_fields("x", &raw).is_err());
    }
}
