//! ferry CLI
//!
//! Single binary for both ends of a tunnel:
//! - Server (public broker that accepts tunnels and proxies HTTP)
//! - Client (agent that exposes a local service through a broker)

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ferry::commands::{self, ClientArgs, ServerArgs};

#[derive(Parser)]
#[command(name = "ferry")]
#[command(author, version, about = "Expose local HTTP services through a public broker")]
#[command(propagate_version = true)]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the public broker that accepts tunnels
    Server(ServerArgs),

    /// Expose a local service through a broker
    Client(ClientArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Server(args) => commands::server::run(args).await,
        Commands::Client(args) => commands::client::run(args).await,
    }
}
