//! wgpeer CLI - Main Entry Point
//!
//! Talks to a running wgpeer daemon over its HTTP API.

use clap::{Parser, Subcommand};

mod client;
mod commands;
mod output;

use commands::{peer, server};

/// wgpeer CLI - WireGuard peer lifecycle manager
#[derive(Parser)]
#[command(name = "wgpeer")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Daemon address
    #[arg(long, env = "WGPEER_ADDR", default_value = "http://127.0.0.1:51819", global = true)]
    daemon_addr: String,

    /// API bearer token
    #[arg(long, env = "WGPEER_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage peers
    #[command(subcommand)]
    Peer(peer::PeerCommands),

    /// Compare store, config document and live interface
    Check,

    /// Rebuild config document and interface from the store
    Repair,

    /// Show client-side tunnel settings
    Config,

    /// Show server uptime and load
    Info,

    /// Check daemon health
    #[command(alias = "health")]
    Status,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    let client = client::DaemonClient::new(&cli.daemon_addr, cli.token.clone())?;

    let result = match cli.command {
        Commands::Peer(cmd) => peer::execute(cmd, client, cli.format).await,
        Commands::Check => server::check(client, cli.format).await,
        Commands::Repair => server::repair(client, cli.format).await,
        Commands::Config => server::config(client, cli.format).await,
        Commands::Info => server::info(client, cli.format).await,
        Commands::Status => server::status(client, &cli.daemon_addr, cli.format).await,
        Commands::Version => {
            println!("wgpeer CLI v{}", wgpeer_common::VERSION);
            Ok(())
        }
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
    Ok(())
}
