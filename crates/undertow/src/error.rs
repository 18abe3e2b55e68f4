use std::io;

use thiserror::Error;
use undertow_common::TunnelError;
use undertow_protocol::ProtocolError;

/// Errors terminating one routed stream on the client
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Proxy authentication required")]
    Auth,

    #[error("Method {0} not allowed")]
    MethodNotAllowed(hyper::Method),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No backend for {0:?}")]
    NoBackend(String),

    #[error("Failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out dialing {0}")]
    DialTimeout(String),

    #[error("Upstream request failed: {0}")]
    Upstream(#[source] hyper_util::client::legacy::Error),
}

/// Errors ending one connection to the server
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Invalid server address {0:?}")]
    InvalidAddress(String),

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake failed: {0}")]
    Tls(#[source] io::Error),

    #[error(transparent)]
    Setup(#[from] TunnelError),

    #[error("Connection failed: {0}")]
    Serve(#[from] hyper::Error),
}

impl ConnectError {
    /// Whether retrying cannot help until the TLS material changes
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::InvalidAddress(_) | Self::Setup(_) => true,
            Self::Tls(e) => matches!(
                e.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()),
                Some(rustls::Error::InvalidCertificate(_))
                    | Some(rustls::Error::NoCertificatesPresented)
            ),
            Self::Connect { .. } | Self::Serve(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_certificate_errors_are_fatal() {
        let invalid = ConnectError::Tls(io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer),
        ));
        assert!(invalid.is_fatal());

        let reset = ConnectError::Tls(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(!reset.is_fatal());

        let refused = ConnectError::Connect {
            addr: "127.0.0.1:1".to_string(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(!refused.is_fatal());
    }
}
