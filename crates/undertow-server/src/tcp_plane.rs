use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use undertow_common::{pipe, relay_bidirectional, BodyReader, Transfer, PIPE_CAPACITY};
use undertow_protocol::{Action, ControlMessage, Protocol};

use crate::error::RelayError;
use crate::registry::Registry;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Accept the next connection, retrying transient errors
///
/// Returns `None` once `shutdown` is cancelled.
pub(crate) async fn accept(
    listener: &TcpListener,
    shutdown: &CancellationToken,
) -> Option<(TcpStream, SocketAddr)> {
    loop {
        let result = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.cancelled() => return None,
        };

        match result {
            Ok(accepted) => return Some(accepted),
            Err(e) => {
                tracing::warn!(
                    addr = ?listener.local_addr().ok(),
                    error = %e,
                    "Accept failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                    _ = shutdown.cancelled() => return None,
                }
            }
        }
    }
}

/// Relays raw connections accepted on a client's public listeners
pub struct TcpPlane {
    registry: Arc<Registry>,
}

impl TcpPlane {
    pub fn new(registry: Arc<Registry>) -> Arc<Self> {
        Arc::new(Self { registry })
    }

    /// Serve one public listener owned by the client registered as `host`
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        host: String,
        protocol: Protocol,
        shutdown: CancellationToken,
    ) {
        let listen_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!(host = %host, error = %e, "Listener has no local address");
                return;
            }
        };
        tracing::info!(host = %host, addr = %listen_addr, %protocol, "Listening");

        while let Some((stream, peer_addr)) = accept(&listener, &shutdown).await {
            let local_addr = stream.local_addr().unwrap_or(listen_addr);
            tracing::debug!(host = %host, peer = %peer_addr, local = %local_addr, "Accepted");

            let message = ControlMessage {
                action: Action::RequestClientSession,
                protocol,
                forwarded_host: listen_addr.to_string(),
                forwarded_for: peer_addr.to_string(),
                forwarded_by: local_addr.to_string(),
                url_path: String::new(),
                remote_addr: peer_addr.ip().to_string(),
            };

            let this = self.clone();
            let host = host.clone();
            tokio::spawn(async move {
                match this.proxy_conn(&host, stream, &message).await {
                    Ok(transfer) => tracing::debug!(
                        host = %host,
                        peer = %peer_addr,
                        sent = transfer.sent,
                        received = transfer.received,
                        "Done"
                    ),
                    Err(e) => tracing::warn!(
                        host = %host,
                        peer = %peer_addr,
                        kind = ?e.kind(),
                        error = %e,
                        "Relay failed"
                    ),
                }
            });
        }
        tracing::debug!(host = %host, addr = %listen_addr, "Listener stopped");
    }

    /// Relay one public connection over a new stream to `host`
    ///
    /// Both directions run to completion before the public connection is
    /// dropped.
    pub async fn proxy_conn(
        &self,
        host: &str,
        stream: TcpStream,
        message: &ControlMessage,
    ) -> Result<Transfer, RelayError> {
        let transport = self
            .registry
            .resolve(host)
            .ok_or_else(|| RelayError::NoRoute(host.to_string()))?;

        let (mut tunnel_writer, body) = pipe(PIPE_CAPACITY);
        let response = match transport.open_stream(host, message, body).await {
            Ok(response) => response,
            Err(e) => {
                self.registry.report_failure(host, &transport, &e);
                return Err(e.into());
            }
        };
        let mut tunnel_reader = BodyReader::new(response.into_body());

        let (mut public_reader, mut public_writer) = stream.into_split();
        Ok(relay_bidirectional(
            (&mut public_reader, &mut public_writer),
            (&mut tunnel_reader, &mut tunnel_writer),
            "local",
            "remote",
        )
        .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unregistered_host_closes_connection() {
        use tokio::io::AsyncReadExt;

        let plane = TcpPlane::new(Registry::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut client = client.unwrap();
        let (stream, _) = accepted.unwrap();

        let err = plane
            .proxy_conn("a.example", stream, &ControlMessage::session(Protocol::Tcp))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NoRoute(_)));

        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_accept_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        assert!(accept(&listener, &shutdown).await.is_none());
    }
}
