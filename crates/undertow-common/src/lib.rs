//! Relay primitives and connection plumbing shared by the Undertow server and client

mod error;
mod headers;
mod identity;
mod keepalive;
mod pipe;
mod relay;
mod tls;

pub use error::TunnelError;
pub use headers::remove_hop_by_hop_headers;
pub use identity::ClientIdentity;
pub use keepalive::{parse_duration, KeepAlive};
pub use pipe::{pipe, BodyReader, PipeBody, PipeWriter, TunnelIo, PIPE_CAPACITY};
pub use relay::{relay, relay_bidirectional, RelaySink, RelaySource, Transfer, TRANSFER_TARGET};
pub use tls::{
    load_certs_from_pem, load_client_config_from_pem, load_server_config_from_pem, resolve_pem,
    TUNNEL_ALPN,
};
