//! The stateless FIFO worker pool.
//!
//! FIFO workers are interchangeable: any member may claim any job from the
//! shared fifo queue, and each job opens and closes its own session. Two
//! jobs against the same device may well run concurrently on different
//! members — that is the point; this queue is for idempotent reads,
//! stateless HTTP APIs, and long transfers that must not block a persisted
//! session.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::driver::DriverRegistry;
use crate::error::Result;
use crate::job::FIFO_QUEUE;
use crate::store::RedisStore;

use super::{claim_job, complete_and_notify, execution_timeout, run_operation};

/// One consumer of the shared fifo queue.
pub struct FifoWorker {
    store: RedisStore,
    config: Arc<Config>,
    registry: Arc<DriverRegistry>,
    cancel: CancellationToken,
    /// Index within this process's pool, for log correlation only
    member: usize,
}

impl FifoWorker {
    /// Creates one pool member.
    pub fn new(
        store: RedisStore,
        config: Arc<Config>,
        registry: Arc<DriverRegistry>,
        cancel: CancellationToken,
        member: usize,
    ) -> Self {
        Self {
            store,
            config,
            registry,
            cancel,
            member,
        }
    }

    /// Runs `worker.fifo_concurrency` consumers until shutdown.
    pub async fn run_pool(
        store: RedisStore,
        config: Arc<Config>,
        registry: Arc<DriverRegistry>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let concurrency = config.worker.fifo_concurrency.max(1);
        info!(concurrency = %concurrency, "FIFO worker pool starting");

        let mut members = Vec::with_capacity(concurrency);
        for member in 0..concurrency {
            let worker = FifoWorker::new(
                store.clone(),
                config.clone(),
                registry.clone(),
                cancel.clone(),
                member,
            );
            members.push(tokio::spawn(worker.run()));
        }

        for member in members {
            match member.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "FIFO pool member failed"),
                Err(e) => error!(error = %e, "FIFO pool member panicked"),
            }
        }

        info!("FIFO worker pool stopped");
        Ok(())
    }

    /// Consumer loop: pop, claim, execute with a fresh session, record.
    pub async fn run(self) -> Result<()> {
        debug!(member = %self.member, "FIFO consumer started");
        let poll = self.config.worker.poll_interval;

        loop {
            let popped = tokio::select! {
                _ = self.cancel.cancelled() => break,
                popped = self.store.pop(FIFO_QUEUE, poll) => popped?,
            };

            let Some(job_id) = popped else { continue };

            if let Err(e) = self.handle_job(&job_id).await {
                error!(member = %self.member, job_id = %job_id, error = %e, "Failed to process job");
            }
        }

        debug!(member = %self.member, "FIFO consumer stopped");
        Ok(())
    }

    /// Executes one claimed job: connect, run, disconnect. No reuse.
    async fn handle_job(&self, job_id: &str) -> Result<()> {
        let Some(mut job) = claim_job(&self.store, job_id, &self.config.job).await? else {
            return Ok(());
        };

        debug!(member = %self.member, job_id = %job.id, driver = %job.request.driver, "Executing fifo job");

        let host = match job.request.host() {
            Ok(host) => host.to_string(),
            Err(e) => {
                let descriptor = e.into_descriptor();
                return complete_and_notify(&self.store, &mut job, Err(descriptor), None, &self.config.job)
                    .await;
            }
        };

        let operation = match job.request.operation() {
            Ok(operation) => operation,
            Err(e) => {
                let descriptor = e.into_descriptor();
                return complete_and_notify(&self.store, &mut job, Err(descriptor), None, &self.config.job)
                    .await;
            }
        };

        let driver = match self.registry.get(&job.request.driver) {
            Ok(driver) => driver,
            Err(e) => {
                let descriptor = e.into_descriptor();
                return complete_and_notify(&self.store, &mut job, Err(descriptor), None, &self.config.job)
                    .await;
            }
        };

        let timeout = execution_timeout(&job, &self.config.job);

        let mut session = match driver
            .connect(&job.request.connection_args, job.request.driver_args.as_ref())
            .await
        {
            Ok(session) => session,
            Err(driver_error) => {
                let descriptor = driver_error
                    .into_error(&job.request.driver, &host)
                    .into_descriptor();
                return complete_and_notify(&self.store, &mut job, Err(descriptor), None, &self.config.job)
                    .await;
            }
        };

        let outcome = run_operation(
            &job.request.driver,
            &host,
            session.as_mut(),
            &operation,
            timeout,
        )
        .await;
        let fingerprint = session.fingerprint();
        let _ = session.disconnect().await;

        complete_and_notify(&self.store, &mut job, outcome, fingerprint, &self.config.job).await
    }
}
