//! CLI for running and controlling handover workers.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod worker;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use handover::config;

#[derive(Parser)]
#[command(
    name = "handover",
    version,
    about = "Zero-downtime listener handover between worker processes"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve TCP listeners and answer supervisor commands.
    Worker(worker::WorkerArgs),

    /// Send one control command to a process.
    Send(SendArgs),

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Arguments for `handover send`.
#[derive(clap::Args)]
struct SendArgs {
    /// Target process ID.
    pid: u32,

    /// Command: heartbeat, reload, restart, shutdown or close.
    command: handover_proto::Command,

    /// Directory holding the control sockets.
    #[arg(long)]
    runtime_dir: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();
    if let Err(e) = Cli::parse().dispatch().await {
        eprintln!("handover: {e:#}");
        std::process::exit(1);
    }
}

/// Logs to stderr, filtered by `RUST_LOG` (default `info`).
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Worker(args) => args.run().await,
            Command::Send(args) => send(args).await,
            Command::Completion { shell } => {
                clap_complete::generate(
                    shell,
                    &mut Self::command(),
                    "handover",
                    &mut std::io::stdout(),
                );
                Ok(())
            }
        }
    }
}

#[cfg(unix)]
async fn send(args: SendArgs) -> Result<()> {
    use handover::Channel;

    let dir = args.runtime_dir.unwrap_or_else(config::runtime_dir);
    let channel = handover::UnixChannel::new(&dir, std::process::id());
    let name = args.command.name();
    channel
        .send(args.pid, args.command)
        .await
        .with_context(|| format!("failed to send {name} to {}", args.pid))
}

#[cfg(not(unix))]
async fn send(_args: SendArgs) -> Result<()> {
    anyhow::bail!("control sockets require Linux or macOS")
}
