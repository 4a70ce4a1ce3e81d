//! ringnet - P2P overlay membership node

use anyhow::Result;
use clap::Parser;
use ringnet_node::{BootstrapConnector, Communicator, Config, Node};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "ringnet")]
#[command(about = "Join a ringnet overlay and keep its routing table", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "ringnet.toml")]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// IP address to advertise (overrides config)
    #[arg(long)]
    ip: Option<IpAddr>,

    /// Peer server port, 0 for any free port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Username to register with (overrides config)
    #[arg(short, long)]
    username: Option<String>,

    /// Bootstrap server address (overrides config)
    #[arg(short, long)]
    bootstrap: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = load_config(&cli)?;
    tracing::info!(
        "Starting node {}:{} against bootstrap server {}",
        config.node.ip,
        config.node.port,
        config.bootstrap.address
    );

    let bootstrap = BootstrapConnector::from_config(&config.bootstrap);
    let communicator = Communicator::from_config(&config.peer);
    let node = Node::new(config, bootstrap, communicator)?;

    node.run_until(shutdown_signal()).await?;

    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::debug!("Received Ctrl-C"),
        _ = terminate => tracing::debug!("Received SIGTERM"),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = if cli.config.exists() {
        tracing::info!("Loading config from {}", cli.config.display());
        Config::load(&cli.config)?
    } else {
        tracing::debug!("No config at {}, using defaults", cli.config.display());
        Config::default()
    };

    if let Some(ip) = cli.ip {
        config.node.ip = ip;
    }
    if let Some(port) = cli.port {
        config.node.port = port;
    }
    if let Some(username) = &cli.username {
        config.node.username = Some(username.clone());
    }
    if let Some(bootstrap) = cli.bootstrap {
        config.bootstrap.address = bootstrap;
    }

    Ok(config)
}
