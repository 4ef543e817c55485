//! Command-line interface definitions.
//!
//! One multi-call binary covers every process kind in the topology; the
//! `pinned-worker` entry point is internal (spawned by the node worker) and
//! hidden from help output.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// NetPulse: distributed orchestrator for heterogeneous network devices.
#[derive(Debug, Parser)]
#[command(name = "netpulse", version, about, long_about = None)]
pub struct Cli {
    /// Path to a configuration file (defaults probe ./netpulse.{yaml,toml})
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Process kind to run
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Parses the process arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Process kinds.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the HTTP API server and dispatcher
    Server,

    /// Run the per-node supervisor (registers capacity, spawns pinned workers)
    NodeWorker,

    /// Run a FIFO worker pool process
    FifoWorker,

    /// Internal: run a pinned worker bound to one device
    #[command(hide = true)]
    PinnedWorker {
        /// Single-use boot payload stash key written by the node worker
        #[arg(long)]
        boot_key: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_server_subcommand() {
        let cli = Cli::try_parse_from(["netpulse", "server"]).unwrap();
        assert!(matches!(cli.command, Commands::Server));
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn parses_pinned_worker_boot_key() {
        let cli =
            Cli::try_parse_from(["netpulse", "pinned-worker", "--boot-key", "abc123"]).unwrap();
        match cli.command {
            Commands::PinnedWorker { boot_key } => assert_eq!(boot_key, "abc123"),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn global_flags_apply_to_subcommands() {
        let cli = Cli::try_parse_from(["netpulse", "node-worker", "-vv"]).unwrap();
        assert!(matches!(cli.command, Commands::NodeWorker));
        assert_eq!(cli.verbose, 2);
    }
}
