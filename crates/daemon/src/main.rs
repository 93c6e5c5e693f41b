//! wgpeer Daemon
//!
//! Owns the peer store, the interface config document and the live
//! WireGuard interface, and serves the peer lifecycle API.

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wgpeer_common::{keys, Database};

mod allocator;
mod api;
mod config;
mod interface;
mod orchestrator;
mod sweeper;
mod wgconf;

use config::DaemonConfig;
use interface::WgCommand;
use orchestrator::PeerOrchestrator;
use wgconf::{ConfigMaterializer, WgConfig};

#[derive(Parser)]
#[command(name = "wgpeerd")]
#[command(about = "wgpeer daemon - WireGuard peer lifecycle manager")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "WGPEER_CONFIG", default_value = "/etc/wgpeer/wgpeerd.toml")]
    config: PathBuf,

    /// Peer database path
    #[arg(long, env = "WGPEER_DB")]
    db: Option<PathBuf>,

    /// API listen address
    #[arg(short, long, env = "WGPEER_LISTEN")]
    listen: Option<String>,

    /// API bearer token
    #[arg(long, env = "WGPEER_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Enable debug logging
    #[arg(short, long, env = "WGPEER_DEBUG")]
    debug: bool,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("wgpeer daemon v{}", wgpeer_common::VERSION);

    let mut config = DaemonConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(db) = cli.db {
        config.store.db_path = db;
    }
    if let Some(listen) = cli.listen {
        config.api.listen = listen;
    }
    if cli.token.is_some() {
        config.api.token = cli.token;
    }
    config.validate()?;

    if cli.init_config {
        config
            .save(&cli.config)
            .with_context(|| format!("writing {}", cli.config.display()))?;
        info!("Wrote configuration to {}", cli.config.display());
        return Ok(());
    }

    let db = Database::open(&config.store.db_path)?;

    let private_key = load_or_create_private_key(&config.wireguard.private_key_path).await?;
    let materializer = ConfigMaterializer::new(&config.wireguard.config_path);
    let initial = WgConfig::with_interface(
        &private_key,
        &gateway_addresses(&config),
        config.wireguard.listen_port,
    );
    materializer.ensure_exists(&initial).await?;

    let tunnel = Arc::new(WgCommand::new(
        &config.wireguard.wg_binary,
        &config.wireguard.interface,
        config.command_timeout(),
    ));

    let orchestrator = Arc::new(PeerOrchestrator::new(
        Arc::new(db),
        tunnel,
        materializer,
        &config.pool,
        config.lifecycle.clone(),
    ));

    if config.wireguard.reload_on_start {
        match orchestrator.repair().await {
            Ok(report) => info!("Interface loaded with {} peers", report.peers),
            Err(e) => warn!("Startup reload failed, continuing: {}", e),
        }
    }

    // Start sweeper
    let sweeper = sweeper::Sweeper::new(orchestrator.clone(), &config.sweeper);
    let sweeper_handle = tokio::spawn(async move { sweeper.run().await });

    // Start API server
    let state = Arc::new(api::ApiState {
        orchestrator,
        server: api::ServerSettings::from(&config.wireguard),
        token: config.api.token.clone(),
    });
    if state.token.is_none() {
        warn!("No API token configured; the API is unauthenticated");
    }
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("binding {}", config.api.listen))?;
    let api_handle = tokio::spawn(async move { axum::serve(listener, api::router(state)).await });

    info!("Daemon started on {}", config.api.listen);

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = api_handle => {
            match result {
                Ok(Err(e)) => error!("API server error: {}", e),
                Err(e) => error!("API server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
        result = sweeper_handle => {
            if let Err(e) = result {
                error!("Sweeper error: {}", e);
            }
        }
    }

    info!("Daemon shutdown complete");
    Ok(())
}

/// Interface addresses: the first host of each pool
fn gateway_addresses(config: &DaemonConfig) -> Vec<String> {
    let v4 = &config.pool.ipv4_cidr;
    let v6 = &config.pool.ipv6_cidr;
    let v4_gateway = std::net::Ipv4Addr::from(u32::from(v4.network()) + config::GATEWAY_OFFSET as u32);
    let v6_gateway = std::net::Ipv6Addr::from(u128::from(v6.network()) + u128::from(config::GATEWAY_OFFSET));
    vec![
        format!("{}/{}", v4_gateway, v4.prefix()),
        format!("{}/{}", v6_gateway, v6.prefix()),
    ]
}

/// Read the interface private key, generating one on first start
async fn load_or_create_private_key(path: &Path) -> anyhow::Result<String> {
    if tokio::fs::try_exists(path).await? {
        let key = tokio::fs::read_to_string(path).await?.trim().to_string();
        keys::validate_key(&key).with_context(|| format!("invalid key in {}", path.display()))?;
        return Ok(key);
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let pair = keys::generate_keypair();
    tokio::fs::write(path, format!("{}\n", pair.private_key)).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    info!("Generated interface key pair, public key {}", pair.public_key);
    Ok(pair.private_key)
}
