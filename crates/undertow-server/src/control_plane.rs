use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use undertow_common::{ClientIdentity, KeepAlive};

use crate::error::ControlError;
use crate::registry::Registry;
use crate::tcp_plane::accept;
use crate::transport::Transport;
use crate::AllowedClient;

/// Accepts client control connections and turns them into routable transports
pub struct ControlPlane {
    registry: Arc<Registry>,
    clients: Vec<AllowedClient>,
    tls_acceptor: TlsAcceptor,
    handshake_timeout: Duration,
    keepalive: Option<KeepAlive>,
}

impl ControlPlane {
    pub fn new(
        registry: Arc<Registry>,
        clients: Vec<AllowedClient>,
        tls_acceptor: TlsAcceptor,
        handshake_timeout: Duration,
        keepalive: Option<KeepAlive>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            clients,
            tls_acceptor,
            handshake_timeout,
            keepalive,
        })
    }

    /// Accept control connections until `shutdown` is cancelled
    pub async fn run(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        while let Some((stream, peer_addr)) = accept(&listener, &shutdown).await {
            tracing::info!(peer = %peer_addr, "Accepted control connection");
            let this = self.clone();

            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream, peer_addr).await {
                    tracing::warn!(
                        peer = %peer_addr,
                        kind = ?e.kind(),
                        error = %e,
                        "Rejected control connection"
                    );
                }
            });
        }
        tracing::debug!("Control plane stopped");
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ControlError> {
        if let Some(keepalive) = &self.keepalive {
            if let Err(e) = keepalive.apply(&stream) {
                tracing::warn!(peer = %peer_addr, error = %e, "Failed to set keep-alive");
            }
        }

        let handshake = self.tls_acceptor.accept(stream);
        let tls_stream = tokio::time::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| ControlError::TlsTimeout)?
            .map_err(ControlError::Tls)?;

        let identity = ClientIdentity::from_tls(&tls_stream)?;
        let client = self
            .find_client(&identity)
            .ok_or(ControlError::UnknownClient(identity))?;

        let transport = self.establish(client, tls_stream, peer_addr).await?;
        tracing::info!(
            host = %client.host,
            client = %client.id,
            peer = %peer_addr,
            connection = transport.id(),
            "Client connected"
        );

        let registry = self.registry.clone();
        let host = client.host.clone();
        tokio::spawn(async move {
            transport.closed().await;
            registry.invalidate_connection(&host, transport.id());
            tracing::info!(host = %host, connection = transport.id(), "Client disconnected");
        });

        Ok(())
    }

    fn find_client(&self, identity: &ClientIdentity) -> Option<&AllowedClient> {
        self.clients.iter().find(|client| client.id == *identity)
    }

    /// Register an authenticated connection for `client` and verify it
    ///
    /// On any failure the connection is closed and its registry entry, if
    /// one was added, is removed.
    pub(crate) async fn establish<T>(
        &self,
        client: &AllowedClient,
        io: T,
        peer_addr: SocketAddr,
    ) -> Result<Transport, ControlError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let transport = Transport::handshake(io, peer_addr).await?;

        if let Err(e) = self.register(client, &transport).await {
            transport.close();
            self.registry.invalidate_connection(&client.host, transport.id());
            return Err(e);
        }
        Ok(transport)
    }

    async fn register(
        &self,
        client: &AllowedClient,
        transport: &Transport,
    ) -> Result<(), ControlError> {
        self.registry.add(&client.host, transport.clone())?;
        transport.probe(&client.host, self.handshake_timeout).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    use http_body_util::Empty;
    use hyper::body::{Bytes, Incoming};
    use hyper::server::conn::http2;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::{TokioExecutor, TokioIo};

    use crate::error::TransportError;

    fn test_client(host: &str) -> AllowedClient {
        AllowedClient {
            id: "00".repeat(32).parse().unwrap(),
            host: host.to_string(),
            listeners: Vec::new(),
        }
    }

    fn control_plane(registry: Arc<Registry>, timeout: Duration) -> Arc<ControlPlane> {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        let tls = undertow_common::load_server_config_from_pem(
            &cert.pem(),
            &key.serialize_pem(),
            &cert.pem(),
        )
        .unwrap();

        ControlPlane::new(
            registry,
            Vec::new(),
            TlsAcceptor::from(Arc::new(tls)),
            timeout,
            None,
        )
    }

    /// Client side of a control connection answering the probe with `status`
    fn fake_client(status: StatusCode) -> tokio::io::DuplexStream {
        let (near, far) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let service = service_fn(move |_req: Request<Incoming>| async move {
                Ok::<_, Infallible>(
                    Response::builder()
                        .status(status)
                        .body(Empty::<Bytes>::new())
                        .unwrap(),
                )
            });
            let _ = http2::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(far), service)
                .await;
        });
        near
    }

    #[tokio::test]
    async fn test_successful_handshake_registers_host() {
        let registry = Registry::new();
        let plane = control_plane(registry.clone(), Duration::from_secs(5));
        let client = test_client("a.example");

        let transport = plane
            .establish(&client, fake_client(StatusCode::OK), "127.0.0.1:1".parse().unwrap())
            .await
            .unwrap();

        assert_eq!(registry.resolve("a.example").unwrap().id(), transport.id());
    }

    #[tokio::test]
    async fn test_non_ok_probe_rejects_and_leaves_no_entry() {
        let registry = Registry::new();
        let plane = control_plane(registry.clone(), Duration::from_secs(5));
        let client = test_client("a.example");

        let err = plane
            .establish(
                &client,
                fake_client(StatusCode::INTERNAL_SERVER_ERROR),
                "127.0.0.1:1".parse().unwrap(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ControlError::Handshake(TransportError::Status(StatusCode::INTERNAL_SERVER_ERROR))
        ));
        assert!(registry.resolve("a.example").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let registry = Registry::new();
        let plane = control_plane(registry.clone(), Duration::from_millis(100));
        let client = test_client("a.example");
        let (near, _far) = tokio::io::duplex(64 * 1024);

        let err = plane
            .establish(&client, near, "127.0.0.1:1".parse().unwrap())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ControlError::Handshake(TransportError::ProbeTimeout(_))
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_host_is_rejected_before_probe() {
        let registry = Registry::new();
        let plane = control_plane(registry.clone(), Duration::from_secs(5));
        let client = test_client("bad host");

        let err = plane
            .establish(&client, fake_client(StatusCode::OK), "127.0.0.1:1".parse().unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, ControlError::Registry(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_failed_reconnect_keeps_live_connection() {
        let registry = Registry::new();
        let plane = control_plane(registry.clone(), Duration::from_secs(5));
        let client = test_client("a.example");

        let live = plane
            .establish(&client, fake_client(StatusCode::OK), "127.0.0.1:1".parse().unwrap())
            .await
            .unwrap();
        let _ = plane
            .establish(
                &client,
                fake_client(StatusCode::FORBIDDEN),
                "127.0.0.1:2".parse().unwrap(),
            )
            .await
            .unwrap_err();

        // The rejected connection replaced the entry during registration and
        // removed its own entry on cleanup; the earlier one stays open.
        assert!(!live.is_closed());
        assert!(registry.resolve("a.example").is_none());
    }
}
