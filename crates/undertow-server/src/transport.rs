//! Server side of a client's multiplexed connection
//!
//! Once a control connection is authenticated the server drives it as an
//! HTTP/2 *client*: every public connection or request becomes one stream,
//! opened with a PUT whose headers carry the [`ControlMessage`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use hyper::body::Incoming;
use hyper::client::conn::http2::{self, SendRequest};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use undertow_common::{pipe, PipeBody};
use undertow_protocol::ControlMessage;

use crate::error::TransportError;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a live multiplexed connection
///
/// Clones share the same connection, which stays open until [`close`] is
/// called or the peer goes away.
///
/// [`close`]: Transport::close
#[derive(Clone)]
pub struct Transport {
    id: u64,
    peer: SocketAddr,
    sender: SendRequest<PipeBody>,
    closed: CancellationToken,
}

impl Transport {
    /// Start an HTTP/2 connection over `io` and spawn its driver
    pub async fn handshake<T>(io: T, peer: SocketAddr) -> Result<Self, TransportError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, connection) = http2::handshake(TokioExecutor::new(), TokioIo::new(io))
            .await
            .map_err(TransportError::Handshake)?;

        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let closed = CancellationToken::new();

        let token = closed.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = connection => {
                    if let Err(e) = result {
                        tracing::debug!(connection = id, %peer, error = %e, "Connection error");
                    }
                }
                _ = token.cancelled() => {}
            }
            token.cancel();
            tracing::debug!(connection = id, %peer, "Connection closed");
        });

        Ok(Self {
            id,
            peer,
            sender,
            closed,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.sender.is_closed()
    }

    /// Close the connection; idempotent
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Send a CONNECT probe for `host` and require a 200 within `timeout`
    pub async fn probe(&self, host: &str, timeout: Duration) -> Result<(), TransportError> {
        let (writer, body) = pipe(1);
        drop(writer);

        let request = Request::builder()
            .method(Method::CONNECT)
            .uri(url(host))
            .body(body)?;

        let response = tokio::time::timeout(timeout, self.send(request))
            .await
            .map_err(|_| TransportError::ProbeTimeout(timeout))??;

        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(TransportError::Status(status)),
        }
    }

    /// Open a logical stream to the client
    ///
    /// `body` carries the public side's bytes; the returned response body
    /// carries the client's bytes back.
    pub async fn open_stream(
        &self,
        host: &str,
        message: &ControlMessage,
        body: PipeBody,
    ) -> Result<Response<Incoming>, TransportError> {
        let mut request = Request::builder()
            .method(Method::PUT)
            .uri(url(host))
            .body(body)?;
        message.write_to(request.headers_mut())?;

        let response = self.send(request).await?;
        if response.status() != StatusCode::OK {
            return Err(TransportError::Status(response.status()));
        }
        Ok(response)
    }

    async fn send(&self, request: Request<PipeBody>) -> Result<Response<Incoming>, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let mut sender = self.sender.clone();
        sender.ready().await.map_err(|_| TransportError::Closed)?;
        Ok(sender.send_request(request).await?)
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn url(host: &str) -> String {
    format!("https://{}", host)
}
