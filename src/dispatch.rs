//! The dispatcher: request validation, queue routing, pinned placement,
//! cancellation, and the synchronous connection test.
//!
//! This is the controller side of the queue topology. Fifo jobs go straight
//! onto the shared queue. Pinned jobs first need a live pinned worker for
//! their host: the dispatcher checks the host→node binding, verifies the
//! node and its descriptor are still live, and otherwise runs the scheduler
//! against a fresh node snapshot and asks the chosen node worker to spawn.
//!
//! Two dispatchers racing to place the same host resolve through the
//! set-if-absent binding write: the loser reads the winner's node and sends
//! its spawn request there, where it is answered with `already_running`.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, DriversConfig};
use crate::driver::DriverRegistry;
use crate::error::{Error, ErrorKind, JobError, Result};
use crate::job::{pinned_queue_name, Job, JobRequest, JobStatus, QueueStrategy, FIFO_QUEUE};
use crate::scheduler::{NodeSnapshot, SchedulerRegistry};
use crate::store::{NodeInfo, NodeReply, NodeRequest, PinnedWorkerDescriptor, RedisStore, SpawnRequest};
use crate::webhook;

/// Receipt returned for an accepted submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTicket {
    /// Assigned job id
    pub job_id: String,
    /// Status at submission time (always `queued`)
    pub status: JobStatus,
    /// Queue the job was routed to
    pub queue: String,
}

/// Per-host failure in a bulk submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkFailure {
    /// Target device host
    pub host: String,
    /// What went wrong
    pub error: JobError,
}

/// Outcome of a bulk submission, partitioned per host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkOutcome {
    /// Accepted jobs
    pub succeeded: Vec<JobTicket>,
    /// Rejected hosts
    pub failed: Vec<BulkFailure>,
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CancelOutcome {
    /// The job was still queued and is now cancelled.
    Cancelled,
    /// The job already started; cooperative cancellation was requested.
    Requested,
    /// The job was already terminal.
    AlreadyTerminal {
        /// Its terminal status
        status: JobStatus,
    },
}

/// Result of the synchronous connection test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    /// Whether a session was established and probed alive
    pub success: bool,
    /// Connect + probe latency
    pub latency_ms: u64,
    /// Error descriptor when the test failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Device identity reported by the driver
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_fingerprint: Option<String>,
}

/// Node and pinned-worker inventory for the workers endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryView {
    /// All registered nodes (live and expired)
    pub nodes: Vec<NodeInfo>,
    /// All pinned-worker descriptors across nodes
    pub workers: Vec<PinnedWorkerDescriptor>,
}

/// Internal spawn attempt result.
enum SpawnResult {
    /// The host's queue is ready.
    Queue(String),
    /// The chosen node was at capacity; retry with a fresh snapshot.
    Capacity,
}

/// Resolves a request's queue strategy.
///
/// Explicit request value wins, then the per-driver configuration map, then
/// the driver's session-reuse capability. Nothing is hardcoded per driver
/// name here.
pub fn resolve_strategy(
    request: &JobRequest,
    drivers_config: &DriversConfig,
    registry: &DriverRegistry,
) -> Result<QueueStrategy> {
    if let Some(strategy) = request.queue_strategy {
        return Ok(strategy);
    }
    if let Some(strategy) = drivers_config.queue_strategy.get(&request.driver) {
        return Ok(*strategy);
    }
    let driver = registry.get(&request.driver)?;
    Ok(if driver.supports_persistent_sessions() {
        QueueStrategy::Pinned
    } else {
        QueueStrategy::Fifo
    })
}

/// The controller-side dispatcher.
pub struct Dispatcher {
    store: RedisStore,
    config: Arc<Config>,
    drivers: Arc<DriverRegistry>,
    schedulers: Arc<SchedulerRegistry>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(
        store: RedisStore,
        config: Arc<Config>,
        drivers: Arc<DriverRegistry>,
        schedulers: Arc<SchedulerRegistry>,
    ) -> Self {
        Self {
            store,
            config,
            drivers,
            schedulers,
        }
    }

    /// Registered driver names (for the info endpoints).
    pub fn driver_names(&self) -> Vec<String> {
        self.drivers.names()
    }

    /// Submits one job and returns its ticket.
    pub async fn submit(&self, request: JobRequest) -> Result<JobTicket> {
        request.validate()?;
        let host = request.host()?.to_string();
        let driver = self.drivers.get(&request.driver)?;
        driver
            .validate_args(&request.connection_args)
            .map_err(|e| e.into_error(&request.driver, &host))?;
        let strategy = resolve_strategy(&request, &self.config.drivers, &self.drivers)?;

        let queue = match strategy {
            QueueStrategy::Fifo => FIFO_QUEUE.to_string(),
            QueueStrategy::Pinned => self.ensure_pinned_worker(&host, &request).await?,
        };

        let job = Job::new(&queue, request);
        self.store.put_job(&job).await?;
        self.store.enqueue(&queue, &job.id).await?;

        info!(job_id = %job.id, queue = %queue, host = %host, "Job submitted");
        Ok(JobTicket {
            job_id: job.id,
            status: JobStatus::Queued,
            queue,
        })
    }

    /// Submits a batch, running the scheduler's batch variant once.
    pub async fn submit_bulk(&self, requests: Vec<JobRequest>) -> Result<BulkOutcome> {
        let mut outcome = BulkOutcome {
            succeeded: Vec::new(),
            failed: Vec::new(),
        };

        // Validate and partition first so scheduling sees only viable work.
        let mut fifo = Vec::new();
        let mut pinned = Vec::new();
        for request in requests {
            let host = match request.validate().and_then(|_| request.host().map(String::from)) {
                Ok(host) => host,
                Err(e) => {
                    outcome.failed.push(BulkFailure {
                        host: request
                            .connection_args
                            .get("host")
                            .and_then(|v| v.as_str())
                            .unwrap_or("unknown")
                            .to_string(),
                        error: e.into_descriptor(),
                    });
                    continue;
                }
            };
            match resolve_strategy(&request, &self.config.drivers, &self.drivers) {
                Ok(QueueStrategy::Fifo) => fifo.push((host, request)),
                Ok(QueueStrategy::Pinned) => pinned.push((host, request)),
                Err(e) => outcome.failed.push(BulkFailure {
                    host,
                    error: e.into_descriptor(),
                }),
            }
        }

        for (host, request) in fifo {
            match self.enqueue_bulk_job(FIFO_QUEUE.to_string(), request).await {
                Ok(ticket) => outcome.succeeded.push(ticket),
                Err(e) => outcome.failed.push(BulkFailure {
                    host,
                    error: e.into_descriptor(),
                }),
            }
        }

        if pinned.is_empty() {
            return Ok(outcome);
        }

        // Hosts whose binding is still valid bypass scheduling entirely.
        let mut needs_placement = Vec::new();
        for (host, request) in pinned {
            match self.valid_binding(&host).await? {
                Some(_) => {
                    let queue = pinned_queue_name(&host);
                    match self.enqueue_bulk_job(queue, request).await {
                        Ok(ticket) => outcome.succeeded.push(ticket),
                        Err(e) => outcome.failed.push(BulkFailure {
                            host,
                            error: e.into_descriptor(),
                        }),
                    }
                }
                None => needs_placement.push((host, request)),
            }
        }

        if needs_placement.is_empty() {
            return Ok(outcome);
        }

        let scheduler = self.schedulers.get(&self.config.worker.scheduler)?;
        let snapshots = self.live_snapshots().await?;
        let hosts: Vec<String> = needs_placement.iter().map(|(h, _)| h.clone()).collect();
        let assignments = scheduler.select_batch(&snapshots, &hosts);

        for (host, request) in needs_placement {
            let Some(Some(node_id)) = assignments.get(&host).cloned() else {
                outcome.failed.push(BulkFailure {
                    host: host.clone(),
                    error: JobError::new(ErrorKind::NoCapacity, "all nodes at pinned capacity"),
                });
                continue;
            };

            match self.place_on_node(&node_id, &host, &request).await {
                Ok(SpawnResult::Queue(queue)) => {
                    match self.enqueue_bulk_job(queue, request).await {
                        Ok(ticket) => outcome.succeeded.push(ticket),
                        Err(e) => outcome.failed.push(BulkFailure {
                            host,
                            error: e.into_descriptor(),
                        }),
                    }
                }
                Ok(SpawnResult::Capacity) => outcome.failed.push(BulkFailure {
                    host,
                    error: JobError::new(ErrorKind::NoCapacity, "node rejected spawn at capacity"),
                }),
                Err(e) => outcome.failed.push(BulkFailure {
                    host,
                    error: e.into_descriptor(),
                }),
            }
        }

        Ok(outcome)
    }

    async fn enqueue_bulk_job(&self, queue: String, request: JobRequest) -> Result<JobTicket> {
        let mut job = Job::new(&queue, request);
        job.timeout_secs = Some(self.config.job.bulk_timeout);
        self.store.put_job(&job).await?;
        self.store.enqueue(&queue, &job.id).await?;
        Ok(JobTicket {
            job_id: job.id,
            status: JobStatus::Queued,
            queue,
        })
    }

    /// Ensures a pinned worker exists for the host; returns its queue name.
    async fn ensure_pinned_worker(&self, host: &str, request: &JobRequest) -> Result<String> {
        if let Some(node_id) = self.valid_binding(host).await? {
            debug!(host = %host, node_id = %node_id, "Reusing existing pinned worker");
            return Ok(pinned_queue_name(host));
        }

        let scheduler = self.schedulers.get(&self.config.worker.scheduler)?;
        let retries = self.config.worker.spawn_retries.max(1);

        for attempt in 1..=retries {
            let snapshots = self.live_snapshots().await?;
            let Some(node_id) = scheduler.select(&snapshots, host) else {
                debug!(host = %host, attempt = %attempt, "Scheduler found no spare capacity");
                continue;
            };

            match self.place_on_node(&node_id, host, request).await? {
                SpawnResult::Queue(queue) => return Ok(queue),
                SpawnResult::Capacity => {
                    // Snapshot was stale; the node is the capacity authority.
                    warn!(host = %host, node_id = %node_id, attempt = %attempt, "Spawn rejected at capacity, retrying");
                    continue;
                }
            }
        }

        Err(Error::NoCapacity {
            host: host.to_string(),
            attempts: retries,
        })
    }

    /// Binds the host (set-if-absent) and asks the bound node to spawn.
    async fn place_on_node(
        &self,
        node_id: &str,
        host: &str,
        request: &JobRequest,
    ) -> Result<SpawnResult> {
        // Set-if-absent: the loser of a concurrent placement follows the
        // winner's node instead of spawning a second worker.
        let target = if self.store.bind_host(host, node_id).await? {
            node_id.to_string()
        } else {
            match self.store.get_binding(host).await? {
                Some(winner) => {
                    debug!(host = %host, winner = %winner, "Lost placement race, following winner");
                    winner
                }
                None => node_id.to_string(),
            }
        };

        let request_id = Uuid::new_v4().to_string();
        self.store
            .send_node_request(
                &target,
                &NodeRequest::Spawn(SpawnRequest {
                    request_id: request_id.clone(),
                    host: host.to_string(),
                    driver: request.driver.clone(),
                    connection_args: request.connection_args.clone(),
                    driver_args: request.driver_args.clone(),
                }),
            )
            .await?;

        let reply = self
            .store
            .await_reply(&request_id, self.config.worker.spawn_reply_timeout)
            .await?;

        match reply {
            Some(NodeReply::Spawned { queue }) | Some(NodeReply::AlreadyRunning { queue }) => {
                Ok(SpawnResult::Queue(queue))
            }
            Some(NodeReply::CapacityExhausted) => {
                self.store.unbind_host_if(host, &target).await?;
                Ok(SpawnResult::Capacity)
            }
            Some(NodeReply::Failed { message }) => {
                self.store.unbind_host_if(host, &target).await?;
                Err(Error::spawn_failed(&target, message))
            }
            Some(NodeReply::Terminated) | Some(NodeReply::NotFound) => {
                self.store.unbind_host_if(host, &target).await?;
                Err(Error::spawn_failed(&target, "unexpected reply to spawn request"))
            }
            None => {
                self.store.unbind_host_if(host, &target).await?;
                Err(Error::timeout(
                    self.config.worker.spawn_reply_timeout.as_secs(),
                    format!("spawn reply from node '{}'", target),
                ))
            }
        }
    }

    /// Returns the bound node id when the binding is still trustworthy:
    /// the node's heartbeat is fresh and it still holds a descriptor for
    /// this host. Stale bindings are removed.
    async fn valid_binding(&self, host: &str) -> Result<Option<String>> {
        let Some(node_id) = self.store.get_binding(host).await? else {
            return Ok(None);
        };

        let node_live = match self.store.get_node(&node_id).await? {
            Some(node) => node.is_live(self.config.worker.node_ttl, Utc::now()),
            None => false,
        };
        if node_live && self.store.get_descriptor(&node_id, host).await?.is_some() {
            return Ok(Some(node_id));
        }

        debug!(host = %host, node_id = %node_id, "Cleaning up stale binding");
        self.store.unbind_host_if(host, &node_id).await?;
        Ok(None)
    }

    async fn live_snapshots(&self) -> Result<Vec<NodeSnapshot>> {
        let now = Utc::now();
        let ttl = self.config.worker.node_ttl;
        let mut snapshots: Vec<NodeSnapshot> = self
            .store
            .list_nodes()
            .await?
            .iter()
            .filter(|node| node.is_live(ttl, now))
            .map(NodeSnapshot::from)
            .collect();
        // Deterministic order for greedy/tie-break behavior.
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(snapshots)
    }

    /// Fetches a job record.
    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        self.store
            .load_job(job_id)
            .await?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))
    }

    /// Lists retained jobs, newest first, optionally filtered by status.
    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let ids = self.store.list_job_ids().await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            // Records may expire between the scan and the read.
            if let Some(job) = self.store.load_job(&id).await? {
                if status.map_or(true, |wanted| job.status == wanted) {
                    jobs.push(job);
                }
            }
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    /// Cancels a job: queued jobs are removed and marked cancelled; started
    /// jobs get the cooperative flag and finish their in-flight driver call.
    pub async fn cancel(&self, job_id: &str) -> Result<CancelOutcome> {
        let mut job = self.get_job(job_id).await?;

        if job.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal { status: job.status });
        }

        if job.status == JobStatus::Queued {
            if self.store.remove_queued(&job.queue, job_id).await? {
                job.mark_cancelled();
                self.store
                    .complete_job(
                        job_id,
                        JobStatus::Cancelled,
                        None,
                        None,
                        std::time::Duration::from_secs(self.config.job.result_ttl),
                    )
                    .await?;
                webhook::fire_for_job(&job, None).await;
                info!(job_id = %job_id, "Cancelled queued job");
                return Ok(CancelOutcome::Cancelled);
            }
            // A worker claimed it between our read and the removal; fall
            // through to the cooperative path.
        }

        self.store.request_cancel(job_id).await?;
        info!(job_id = %job_id, "Requested cooperative cancellation");
        Ok(CancelOutcome::Requested)
    }

    /// Synchronous connection test: connect, probe, disconnect.
    pub async fn test_connection(
        &self,
        driver_name: &str,
        connection_args: &serde_json::Value,
        driver_args: Option<&serde_json::Value>,
    ) -> TestReport {
        let started = Instant::now();

        let outcome = async {
            let driver = self.drivers.get(driver_name)?;
            let host = connection_args
                .get("host")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            let mut session = driver
                .connect(connection_args, driver_args)
                .await
                .map_err(|e| e.into_error(driver_name, &host))?;

            let alive = session.is_alive().await;
            let fingerprint = session.fingerprint();
            let _ = session.disconnect().await;

            if alive {
                Ok(fingerprint)
            } else {
                Err(Error::connect_failed(host, "session probe failed"))
            }
        }
        .await;

        let latency_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(fingerprint) => TestReport {
                success: true,
                latency_ms,
                error: None,
                device_fingerprint: fingerprint,
            },
            Err(e) => TestReport {
                success: false,
                latency_ms,
                error: Some(e.into_descriptor()),
                device_fingerprint: None,
            },
        }
    }

    /// Node and worker inventory across the deployment.
    pub async fn worker_inventory(&self) -> Result<InventoryView> {
        let nodes = self.store.list_nodes().await?;
        let mut workers = Vec::new();
        for node in &nodes {
            workers.extend(self.store.list_descriptors(&node.id).await?);
        }
        Ok(InventoryView { nodes, workers })
    }

    /// Forcibly terminates the pinned worker for a host through its node
    /// worker. Returns false when no such worker is known.
    pub async fn terminate_worker(&self, host: &str) -> Result<bool> {
        let Some(node_id) = self.store.get_binding(host).await? else {
            return Ok(false);
        };

        let request_id = Uuid::new_v4().to_string();
        self.store
            .send_node_request(
                &node_id,
                &NodeRequest::Terminate {
                    request_id: request_id.clone(),
                    host: host.to_string(),
                },
            )
            .await?;

        match self
            .store
            .await_reply(&request_id, self.config.worker.spawn_reply_timeout)
            .await?
        {
            Some(NodeReply::Terminated) => Ok(true),
            Some(NodeReply::NotFound) | None => Ok(false),
            Some(other) => {
                warn!(host = %host, reply = ?other, "Unexpected reply to terminate request");
                Ok(false)
            }
        }
    }

    /// Liveness of the store, for the health endpoint.
    pub async fn health(&self) -> Result<()> {
        self.store.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> DriverRegistry {
        DriverRegistry::with_builtins(&[
            "ssh".to_string(),
            "http".to_string(),
            "sftp".to_string(),
        ])
        .unwrap()
    }

    fn request(driver: &str, strategy: Option<&str>) -> JobRequest {
        let mut value = json!({
            "driver": driver,
            "connection_args": {"host": "10.0.0.1", "username": "u", "password": "p"},
            "command": "show version",
        });
        if let Some(strategy) = strategy {
            value["queue_strategy"] = json!(strategy);
        }
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn explicit_strategy_wins() {
        let config = DriversConfig::default();
        let registry = registry();
        let strategy = resolve_strategy(&request("http", Some("pinned")), &config, &registry);
        assert_eq!(strategy.unwrap(), QueueStrategy::Pinned);
    }

    #[test]
    fn config_map_overrides_driver_capability() {
        let mut config = DriversConfig::default();
        config
            .queue_strategy
            .insert("ssh".to_string(), QueueStrategy::Fifo);
        let registry = registry();
        let strategy = resolve_strategy(&request("ssh", None), &config, &registry);
        assert_eq!(strategy.unwrap(), QueueStrategy::Fifo);
    }

    #[test]
    fn capability_default_when_unconfigured() {
        let config = DriversConfig::default();
        let registry = registry();
        assert_eq!(
            resolve_strategy(&request("ssh", None), &config, &registry).unwrap(),
            QueueStrategy::Pinned
        );
        assert_eq!(
            resolve_strategy(&request("http", None), &config, &registry).unwrap(),
            QueueStrategy::Fifo
        );
        assert_eq!(
            resolve_strategy(&request("sftp", None), &config, &registry).unwrap(),
            QueueStrategy::Fifo
        );
    }

    #[test]
    fn unknown_driver_fails_resolution() {
        let config = DriversConfig::default();
        let registry = registry();
        assert!(resolve_strategy(&request("telnet", None), &config, &registry).is_err());
    }
}
