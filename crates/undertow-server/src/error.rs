use std::time::Duration;

use hyper::StatusCode;
use thiserror::Error;
use undertow_common::{ClientIdentity, TunnelError};
use undertow_protocol::ProtocolError;

/// Coarse classification used in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The peer could not be identified or is not allowed
    Authentication,
    /// No live connection for the requested host
    Routing,
    /// The multiplexed connection failed
    Transport,
    /// A control message could not be encoded or decoded
    Protocol,
    /// The tunnelled exchange failed past the transport
    Upstream,
}

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Invalid host: {0:?}")]
    InvalidHost(String),
}

/// Errors raised by a multiplexed client connection
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP/2 handshake failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("Connection closed")]
    Closed,

    #[error("Stream failed: {0}")]
    Stream(#[from] hyper::Error),

    #[error("Client answered with status {0}")]
    Status(StatusCode),

    #[error("Handshake probe timed out after {0:?}")]
    ProbeTimeout(Duration),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Invalid stream request: {0}")]
    Request(#[from] http::Error),
}

impl TransportError {
    /// Whether the error means the whole connection is unusable
    pub fn is_connection_level(&self) -> bool {
        match self {
            Self::Handshake(_) | Self::Closed | Self::ProbeTimeout(_) => true,
            Self::Stream(e) => e.is_closed() || e.is_canceled(),
            Self::Status(_) | Self::Protocol(_) | Self::Request(_) => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol(_) => ErrorKind::Protocol,
            _ => ErrorKind::Transport,
        }
    }
}

/// Reasons a control connection is rejected
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("TLS handshake failed: {0}")]
    Tls(#[source] std::io::Error),

    #[error("TLS handshake timed out")]
    TlsTimeout,

    #[error(transparent)]
    Certificate(#[from] TunnelError),

    #[error("Unknown client certificate {0}")]
    UnknownClient(ClientIdentity),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] TransportError),
}

impl ControlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Tls(_) | Self::TlsTimeout | Self::Certificate(_) | Self::UnknownClient(_) => {
                ErrorKind::Authentication
            }
            Self::Registry(_) => ErrorKind::Routing,
            Self::Handshake(e) => e.kind(),
        }
    }
}

/// Errors of a single relayed public connection or request
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Request has no host")]
    MissingHost,

    #[error("No client connected for {0}")]
    NoRoute(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Tunnelled exchange failed: {0}")]
    Upstream(#[source] hyper::Error),
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingHost | Self::NoRoute(_) => ErrorKind::Routing,
            Self::Transport(e) => e.kind(),
            Self::Upstream(_) => ErrorKind::Upstream,
        }
    }
}

/// Startup errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
