//! Undertow tunnel server library
//!
//! Accepts authenticated client connections, keeps one live connection per
//! client host and relays public traffic to it. [`TunnelServer`] wires the
//! planes together; the planes can also be embedded on their own, e.g. to
//! mount [`HttpPlane::handle`] inside another HTTP server.

mod config;
mod control_plane;
mod error;
mod http_plane;
mod registry;
mod tcp_plane;
mod transport;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use undertow_common::{ClientIdentity, KeepAlive};
use undertow_protocol::Protocol;

pub use config::{ClientConfig, ListenerConfig, ResolvedServerConfig, ServerConfig};
pub use control_plane::ControlPlane;
pub use error::{ControlError, ErrorKind, RegistryError, RelayError, ServerError, TransportError};
pub use http_plane::{HttpPlane, ResponseBody};
pub use registry::Registry;
pub use tcp_plane::TcpPlane;
pub use transport::Transport;

/// A public listener owned by one client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerBinding {
    pub addr: SocketAddr,
    pub protocol: Protocol,
}

/// A client allowed to connect, and what it serves
#[derive(Debug, Clone)]
pub struct AllowedClient {
    pub id: ClientIdentity,
    /// Registry key under which the client's connection is routed
    pub host: String,
    pub listeners: Vec<ListenerBinding>,
}

/// Everything [`TunnelServer::start`] needs
pub struct ServerSettings {
    pub control_addr: SocketAddr,
    /// HTTP entry point; disabled when `None`
    pub http_addr: Option<SocketAddr>,
    pub tls: Arc<rustls::ServerConfig>,
    pub clients: Vec<AllowedClient>,
    /// Bound on the TLS handshake and on the registration probe
    pub handshake_timeout: Duration,
    pub keepalive: Option<KeepAlive>,
}

/// A running server instance
///
/// Each instance owns its registry, so several servers can run in one
/// process.
pub struct TunnelServer {
    control_addr: SocketAddr,
    http_addr: Option<SocketAddr>,
    listener_addrs: Vec<(String, SocketAddr)>,
    registry: Arc<Registry>,
    http_plane: Arc<HttpPlane>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TunnelServer {
    /// Bind every listener and start serving
    ///
    /// Fails without serving anything if any address cannot be bound.
    pub async fn start(settings: ServerSettings) -> Result<Self, ServerError> {
        let registry = Registry::new();
        let shutdown = CancellationToken::new();

        let control_listener = bind(settings.control_addr).await?;
        let control_addr = control_listener.local_addr()?;

        let mut client_listeners = Vec::new();
        let mut listener_addrs = Vec::new();
        for client in &settings.clients {
            for binding in &client.listeners {
                let listener = bind(binding.addr).await?;
                listener_addrs.push((client.host.clone(), listener.local_addr()?));
                client_listeners.push((listener, client.host.clone(), binding.protocol));
            }
        }

        let http_listener = match settings.http_addr {
            Some(addr) => Some(bind(addr).await?),
            None => None,
        };
        let http_addr = http_listener
            .as_ref()
            .map(TcpListener::local_addr)
            .transpose()?;

        let client_count = settings.clients.len();
        let control_plane = ControlPlane::new(
            registry.clone(),
            settings.clients,
            TlsAcceptor::from(settings.tls),
            settings.handshake_timeout,
            settings.keepalive,
        );
        let tcp_plane = TcpPlane::new(registry.clone());
        let http_plane = HttpPlane::new(registry.clone());

        let mut tasks = vec![tokio::spawn(
            control_plane.run(control_listener, shutdown.clone()),
        )];
        for (listener, host, protocol) in client_listeners {
            tasks.push(tokio::spawn(tcp_plane.clone().run(
                listener,
                host,
                protocol,
                shutdown.clone(),
            )));
        }
        if let Some(listener) = http_listener {
            tasks.push(tokio::spawn(
                http_plane.clone().run(listener, shutdown.clone()),
            ));
        }

        tracing::info!(
            addr = %control_addr,
            http = ?http_addr,
            clients = client_count,
            listeners = listener_addrs.len(),
            "Server started"
        );

        Ok(Self {
            control_addr,
            http_addr,
            listener_addrs,
            registry,
            http_plane,
            shutdown,
            tasks,
        })
    }

    /// Bound control address
    pub fn addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// Bound HTTP entry point address, if enabled
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// Bound public listeners as `(client host, address)`, in configuration order
    pub fn listener_addrs(&self) -> &[(String, SocketAddr)] {
        &self.listener_addrs
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Handler for mounting the HTTP entry point on another server
    pub fn http_plane(&self) -> &Arc<HttpPlane> {
        &self.http_plane
    }

    /// Stop accepting, wait for the accept loops and close every client connection
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Accept loop ended abnormally");
            }
        }
        self.registry.close_all();
        tracing::info!(addr = %self.control_addr, "Server stopped");
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}
