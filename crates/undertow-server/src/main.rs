use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use undertow_server::{ServerConfig, TunnelServer};

/// Tunnel server - authenticates clients and routes public traffic to them
#[derive(Parser, Debug)]
#[command(name = "undertow-server")]
#[command(about = "Self-hosted reverse tunnel server")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "server.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install crypto provider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("undertow_server=info".parse()?)
                .add_directive("undertow_common=info".parse()?),
        )
        .init();

    let args = Args::parse();
    tracing::info!(config = %args.config, "Starting tunnel server");

    let config = ServerConfig::load_and_resolve(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    for client in &config.clients {
        tracing::info!(
            host = %client.host,
            client = %client.id,
            listeners = client.listeners.len(),
            "Allowed client"
        );
    }

    let settings = config.into_settings()?;
    let server = TunnelServer::start(settings)
        .await
        .context("Failed to start server")?;

    for (host, addr) in server.listener_addrs() {
        tracing::info!(%host, %addr, "Public listener");
    }

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, cleaning up...");
    server.shutdown().await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
