//! Worker processes and their shared execution path.
//!
//! Three worker kinds consume the queues:
//!
//! - [`fifo::FifoWorker`] — interchangeable pool members on the shared fifo
//!   queue, fresh session per job;
//! - [`pinned::PinnedWorker`] — one per device, reusing a persisted session;
//! - [`node::NodeWorker`] — per-node supervisor that spawns and reaps pinned
//!   workers.
//!
//! The claim/execute/record steps are identical across worker kinds and live
//! here: queue-life enforcement at claim time, execution timeout around the
//! driver call, terminal-state persistence, webhook delivery.

pub mod fifo;
pub mod node;
pub mod pinned;

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::JobConfig;
use crate::driver::Session;
use crate::error::{ErrorKind, JobError, Result};
use crate::job::{Job, JobStatus, Operation};
use crate::store::RedisStore;
use crate::webhook;

/// Claims a popped job id for execution.
///
/// Returns `Some(job)` with the record marked `started`, or `None` when the
/// job is gone, already terminal, cancelled, or expired in the queue (the
/// terminal state is written here in those last two cases).
pub(crate) async fn claim_job(
    store: &RedisStore,
    job_id: &str,
    job_config: &JobConfig,
) -> Result<Option<Job>> {
    let Some(mut job) = store.load_job(job_id).await? else {
        warn!(job_id = %job_id, "Popped job id has no record, skipping");
        return Ok(None);
    };

    if job.status != JobStatus::Queued {
        debug!(job_id = %job_id, status = %job.status, "Job no longer queued, skipping");
        return Ok(None);
    }

    if job.cancel_requested {
        job.mark_cancelled();
        store
            .complete_job(
                &job.id,
                JobStatus::Cancelled,
                None,
                None,
                Duration::from_secs(job_config.result_ttl),
            )
            .await?;
        webhook::fire_for_job(&job, None).await;
        debug!(job_id = %job_id, "Job cancelled before start");
        return Ok(None);
    }

    if job.queue_expired(job_config.ttl, Utc::now()) {
        let error = JobError::new(ErrorKind::Timeout, "queue_expired");
        job.mark_failed(error.clone());
        store
            .complete_job(
                &job.id,
                JobStatus::Failed,
                None,
                Some(&error),
                Duration::from_secs(job_config.result_ttl),
            )
            .await?;
        webhook::fire_for_job(&job, None).await;
        warn!(job_id = %job_id, "Job exceeded queue-life before start");
        return Ok(None);
    }

    job.mark_started();
    store.mark_job_started(&job.id).await?;
    Ok(Some(job))
}

/// Runs the job's operation on a session under the execution timeout.
pub(crate) async fn run_operation(
    driver_name: &str,
    host: &str,
    session: &mut dyn Session,
    operation: &Operation,
    timeout: Duration,
) -> std::result::Result<serde_json::Value, JobError> {
    let call = async {
        match operation {
            Operation::Command(commands) => session.send(commands).await,
            Operation::Config(lines) => session.config(lines).await,
        }
    };

    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(driver_error)) => Err(driver_error.into_error(driver_name, host).into_descriptor()),
        Err(_) => Err(JobError::new(
            ErrorKind::Timeout,
            format!("execution exceeded {} seconds", timeout.as_secs()),
        )),
    }
}

/// Effective execution timeout for a job.
pub(crate) fn execution_timeout(job: &Job, job_config: &JobConfig) -> Duration {
    Duration::from_secs(job.timeout_secs.unwrap_or(job_config.timeout))
}

/// Writes a job's terminal state and fires its webhook.
///
/// A cancellation requested while the driver call was in flight wins over
/// the call's outcome: the in-flight call completed, but the job reports
/// `cancelled`.
pub(crate) async fn complete_and_notify(
    store: &RedisStore,
    job: &mut Job,
    outcome: std::result::Result<serde_json::Value, JobError>,
    fingerprint: Option<String>,
    job_config: &JobConfig,
) -> Result<()> {
    let cancelled_in_flight = store.cancel_requested(&job.id).await.unwrap_or(false);

    if cancelled_in_flight {
        job.mark_cancelled();
    } else {
        match outcome {
            Ok(result) => job.mark_finished(result),
            Err(error) => job.mark_failed(error),
        }
    }

    store
        .complete_job(
            &job.id,
            job.status,
            job.result.as_ref(),
            job.error.as_ref(),
            Duration::from_secs(job_config.result_ttl),
        )
        .await?;

    webhook::fire_for_job(job, fingerprint).await;
    Ok(())
}
