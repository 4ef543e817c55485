//! # NetPulse - Distributed Network Device Orchestrator
//!
//! NetPulse operates heterogeneous network devices (routers, switches, Linux
//! hosts) through pluggable drivers behind a unified HTTP API. Its core is a
//! Redis-backed job queue system that multiplexes two fundamentally
//! different workloads: unordered parallel queries over a shared fifo queue,
//! and per-device serialized configuration over device-pinned queues whose
//! workers hold long-lived sessions open across jobs.
//!
//! ## Core Concepts
//!
//! - **Drivers**: plugins that know how to talk to one family of devices
//!   (SSH/CLI, HTTP APIs, SFTP)
//! - **Jobs**: submitted operations with a status lifecycle, stored in Redis
//! - **Queues**: one shared `fifo` list plus one `pinned_{host}` list per
//!   device
//! - **Pinned Workers**: one process per device, reusing one session, with a
//!   keepalive monitor and suicide-on-failure semantics
//! - **FIFO Workers**: an interchangeable pool opening a fresh session per job
//! - **Node Workers**: per-node supervisors that publish capacity, spawn and
//!   reap pinned workers
//! - **Schedulers**: pure plugins choosing a node for a new pinned worker
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        HTTP API (axum)                              │
//! │   /device/exec  /device/bulk  /device/test  /job  /worker  /health  │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                      Dispatcher (controller)                        │
//! │      strategy resolution · scheduler · spawn requests · cancel      │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              Redis                                  │
//! │   queues · job records · host→node map · node inventory · RPC       │
//! └─────────────────────────────────────────────────────────────────────┘
//!          │                       │                        │
//!          ▼                       ▼                        ▼
//! ┌─────────────────┐   ┌─────────────────────┐   ┌─────────────────────┐
//! │  FIFO Workers   │   │    Node Workers     │   │   Pinned Workers    │
//! │ (fresh session  │   │ (spawn/reap, caps,  │   │ (one device, one    │
//! │   per job)      │   │    heartbeats)      │   │ persisted session)  │
//! └─────────────────┘   └─────────────────────┘   └─────────────────────┘
//!          │                                                │
//!          └────────────────────┬───────────────────────────┘
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │              Drivers (ssh · http · sftp) → Devices                  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use netpulse::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Arc::new(Config::load(None)?);
//!     let store = RedisStore::connect(&config.redis).await?;
//!
//!     let dispatcher = Dispatcher::new(
//!         store,
//!         config.clone(),
//!         Arc::new(DriverRegistry::with_builtins(&config.drivers.enabled)?),
//!         Arc::new(SchedulerRegistry::with_builtins()),
//!     );
//!
//!     let ticket = dispatcher.submit(request).await?;
//!     println!("queued as {} on {}", ticket.job_id, ticket.queue);
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]

pub mod api;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod job;
pub mod scheduler;
pub mod store;
pub mod webhook;
pub mod worker;

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::dispatch::{BulkOutcome, CancelOutcome, Dispatcher, JobTicket, TestReport};
    pub use crate::driver::{Driver, DriverRegistry, Session};
    pub use crate::error::{Error, ErrorKind, JobError, Result};
    pub use crate::job::{Job, JobRequest, JobStatus, Operation, QueueStrategy};
    pub use crate::scheduler::{NodeSnapshot, Scheduler, SchedulerRegistry};
    pub use crate::store::RedisStore;
    pub use crate::webhook::WebhookSpec;
}

/// Crate version string.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
