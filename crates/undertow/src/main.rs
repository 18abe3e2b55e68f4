use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use undertow::{env_var, ClientConfig, Connector};
use undertow_common::{resolve_pem, ClientIdentity};

/// Undertow - expose local services through an outbound tunnel
#[derive(Parser, Debug)]
#[command(name = "undertow")]
#[command(about = "Expose local services through an outbound tunnel")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file
    #[arg(short, long, default_value = "client.toml")]
    config: String,

    /// Tunnel server address (host:port)
    #[arg(short, long)]
    server: Option<String>,

    /// Default backend (e.g., 127.0.0.1:3000)
    #[arg(short, long)]
    backend: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the identity of a certificate, for the server's client list
    Id {
        /// Certificate (file path or inline PEM)
        cert: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install crypto provider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let cli = Cli::parse();
    if let Some(Commands::Id { cert }) = &cli.command {
        return print_identity(cert);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("undertow=info".parse()?)
                .add_directive("undertow_common=info".parse()?),
        )
        .init();

    // Flags win over the environment, which wins over the file
    let config = ClientConfig::load(&cli.config)
        .resolve_with(|name| {
            match name {
                "SERVER_ADDR" => cli.server.clone(),
                "BACKEND" => cli.backend.clone(),
                _ => None,
            }
            .or_else(|| env_var(name))
        })
        .with_context(|| format!("Failed to load config from {}", cli.config))?;

    let connector = config.connector()?;
    run(connector, config.reconnect_delay).await
}

fn print_identity(cert: &str) -> Result<()> {
    let pem = resolve_pem(cert)?;
    let identity = ClientIdentity::from_pem(&pem).context("Failed to read certificate")?;
    println!("{}", identity);
    Ok(())
}

/// Keep a connection to the server until shutdown or a fatal error
async fn run(connector: Connector, reconnect_delay: Duration) -> Result<()> {
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tracing::info!(server = connector.server_addr(), "Connecting");

        tokio::select! {
            result = connector.run() => match result {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "Connection failed, not retrying");
                    return Err(e.into());
                }
                Err(e) => tracing::error!(error = %e, "Connection failed"),
            },
            _ = &mut shutdown => break,
        }

        tracing::info!(delay = ?reconnect_delay, "Reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = &mut shutdown => break,
        }
    }

    tracing::info!("Client shutdown complete");
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
