//! Workspace network daemon CLI

// Use mimalloc as the global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "wsnet",
    author,
    version,
    about = "Workspace network daemon",
    long_about = "Joins a workspace to its overlay network and serves SSH, port forwarding\n\
                  and the rendezvous socket for gRPC and HTTP tunnelling.",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Daemon(commands::daemon::DaemonArgs),

    /// Check a running daemon through its rendezvous socket
    Health(commands::health::HealthArgs),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(args) => commands::daemon::run(args).await,
        Commands::Health(args) => commands::health::run(args).await,
        Commands::Version => {
            commands::version::run();
            Ok(())
        }
    }
}
