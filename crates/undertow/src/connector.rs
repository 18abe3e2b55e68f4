//! Client end of the multiplexed connection
//!
//! The client dials the server over mutual TLS and then serves HTTP/2 on the
//! connection: the server opens one stream per public connection or request,
//! and the [`Dispatcher`] hands each one to the matching proxy.

use std::convert::Infallible;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use undertow_common::{pipe, BodyReader, KeepAlive, PipeBody, PIPE_CAPACITY};
use undertow_protocol::{ControlMessage, Protocol};

use crate::error::ConnectError;
use crate::forwarding_proxy::ForwardingProxy;
use crate::tcp_proxy::TcpProxy;

/// Routes streams opened by the server to the proxy for their protocol
pub struct Dispatcher {
    forwarding: Arc<ForwardingProxy>,
    tcp: Arc<TcpProxy>,
}

impl Dispatcher {
    pub fn new(forwarding: Arc<ForwardingProxy>, tcp: Arc<TcpProxy>) -> Arc<Self> {
        Arc::new(Self { forwarding, tcp })
    }

    /// Serve HTTP/2 over `io` until the server closes the connection
    pub async fn serve<T>(self: Arc<Self>, io: T) -> Result<(), hyper::Error>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service = service_fn(move |req| {
            let this = self.clone();
            async move { Ok::<_, Infallible>(this.dispatch(req)) }
        });

        http2::Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(io), service)
            .await
    }

    fn dispatch(&self, req: Request<Incoming>) -> Response<PipeBody> {
        match req.method() {
            // Registration probe
            &Method::CONNECT => {
                tracing::debug!(uri = %req.uri(), "Answering probe");
                status(StatusCode::OK)
            }
            &Method::PUT => self.open(req),
            _ => {
                tracing::warn!(method = %req.method(), "Unexpected stream method");
                status(StatusCode::METHOD_NOT_ALLOWED)
            }
        }
    }

    fn open(&self, req: Request<Incoming>) -> Response<PipeBody> {
        let message = match ControlMessage::read_from(req.headers()) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid control message");
                return status(StatusCode::BAD_REQUEST);
            }
        };
        tracing::debug!(%message, "Stream opened");

        let (sink, body) = pipe(PIPE_CAPACITY);
        let source = BodyReader::new(req.into_body());

        match message.protocol {
            Protocol::Tcp => {
                let tcp = self.tcp.clone();
                tokio::spawn(async move { tcp.handle(sink, source, &message).await });
            }
            Protocol::Http | Protocol::HttpConnect => {
                tokio::spawn(self.forwarding.clone().handle(sink, source, message));
            }
        }

        Response::new(body)
    }
}

/// Response with `status` and an empty body
fn status(status: StatusCode) -> Response<PipeBody> {
    let (_, body) = pipe(1);
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

/// Dials the server and serves one connection at a time
pub struct Connector {
    server_addr: String,
    server_name: ServerName<'static>,
    tls: TlsConnector,
    keepalive: Option<KeepAlive>,
    dispatcher: Arc<Dispatcher>,
}

impl Connector {
    /// The TLS server name is the host part of `server_addr`
    pub fn new(
        server_addr: String,
        tls: Arc<rustls::ClientConfig>,
        keepalive: Option<KeepAlive>,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self, ConnectError> {
        let server_name = ServerName::try_from(server_host(&server_addr).to_string())
            .map_err(|_| ConnectError::InvalidAddress(server_addr.clone()))?;

        Ok(Self {
            server_addr,
            server_name,
            tls: TlsConnector::from(tls),
            keepalive,
            dispatcher,
        })
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    /// Connect and serve until the connection ends
    pub async fn run(&self) -> Result<(), ConnectError> {
        let stream = TcpStream::connect(&self.server_addr)
            .await
            .map_err(|source| ConnectError::Connect {
                addr: self.server_addr.clone(),
                source,
            })?;
        if let Some(keepalive) = &self.keepalive {
            keepalive.apply(&stream)?;
        }

        let stream = self
            .tls
            .connect(self.server_name.clone(), stream)
            .await
            .map_err(ConnectError::Tls)?;
        tracing::info!(server = %self.server_addr, "Connected");

        self.dispatcher.clone().serve(stream).await?;
        tracing::info!(server = %self.server_addr, "Connection closed by server");
        Ok(())
    }
}

/// Host part of `host:port` or `[v6]:port`
fn server_host(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split_once(']').map_or(rest, |(host, _)| host);
    }
    match addr.rsplit_once(':') {
        Some((host, _)) if !host.contains(':') => host,
        _ => addr,
    }
}
