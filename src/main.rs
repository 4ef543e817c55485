//! NetPulse - distributed orchestrator for heterogeneous network devices.
//!
//! This is the main entry point for every NetPulse process kind: the API
//! server, the per-node supervisor, the FIFO worker pool, and the internal
//! pinned worker spawned by the node worker.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use netpulse::api::ApiServer;
use netpulse::cli::{Cli, Commands};
use netpulse::config::Config;
use netpulse::dispatch::Dispatcher;
use netpulse::driver::DriverRegistry;
use netpulse::scheduler::SchedulerRegistry;
use netpulse::store::RedisStore;
use netpulse::worker::fifo::FifoWorker;
use netpulse::worker::node::NodeWorker;
use netpulse::worker::pinned::PinnedWorker;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let config = Arc::new(config);

    init_logging(cli.verbose, &config.log.level, config.log.json);

    let store = RedisStore::connect(&config.redis)
        .await
        .context("failed to connect to Redis")?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    match cli.command {
        Commands::Server => run_server(store, config, cancel).await,
        Commands::NodeWorker => NodeWorker::new(store, config, cancel)
            .run()
            .await
            .map_err(Into::into),
        Commands::FifoWorker => {
            let registry = Arc::new(DriverRegistry::with_builtins(&config.drivers.enabled)?);
            FifoWorker::run_pool(store, config, registry, cancel)
                .await
                .map_err(Into::into)
        }
        Commands::PinnedWorker { boot_key } => {
            run_pinned_worker(store, config, cancel, &boot_key).await
        }
    }
}

/// Runs the HTTP API server and dispatcher.
async fn run_server(store: RedisStore, config: Arc<Config>, cancel: CancellationToken) -> Result<()> {
    let drivers = Arc::new(DriverRegistry::with_builtins(&config.drivers.enabled)?);
    let schedulers = Arc::new(SchedulerRegistry::with_builtins());

    // Fail fast on a misconfigured scheduler name.
    schedulers.get(&config.worker.scheduler)?;

    let dispatcher = Dispatcher::new(store, config.clone(), drivers, schedulers);
    let server = ApiServer::new(config, dispatcher);

    let shutdown = async move { cancel.cancelled().await };
    server.run(shutdown).await.map_err(Into::into)
}

/// Runs a pinned worker from its boot stash.
async fn run_pinned_worker(
    store: RedisStore,
    config: Arc<Config>,
    cancel: CancellationToken,
    boot_key: &str,
) -> Result<()> {
    let Some(boot) = store.take_boot_payload(boot_key).await? else {
        bail!("boot payload '{}' missing or already consumed", boot_key);
    };

    let registry = DriverRegistry::with_builtins(&config.drivers.enabled)?;
    let driver = registry.get(&boot.driver)?;

    PinnedWorker::new(store, config, driver, boot, cancel)
        .run()
        .await
        .map_err(Into::into)
}

/// Cancels the root token on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGTERM handler");
                    return;
                }
            };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        tracing::info!("Shutdown signal received");
        cancel.cancel();
    });
}

/// Initializes logging from verbosity flags and configuration.
fn init_logging(verbosity: u8, configured_level: &str, json: bool) {
    let level = match verbosity {
        0 => configured_level.to_string(),
        1 => "info".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(verbosity >= 3))
            .with(env_filter)
            .init();
    }
}
