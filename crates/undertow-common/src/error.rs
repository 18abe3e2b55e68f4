use thiserror::Error;

/// Common errors for tunnel operations
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Invalid client identity: {0}")]
    Identity(String),

    #[error("Invalid keep-alive option: {0}")]
    KeepAlive(String),

    #[error("Connection closed")]
    ConnectionClosed,
}
