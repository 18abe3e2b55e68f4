//! Undertow tunnel client library
//!
//! [`Connector`] keeps the outbound connection to the server and hands every
//! stream routed over it to the [`ForwardingProxy`] or the [`TcpProxy`],
//! which deliver it to a local backend.

mod auth;
mod backends;
mod config;
mod connector;
mod deadline;
mod error;
mod forwarding_proxy;
mod tcp_proxy;

pub use auth::{parse_basic_proxy_auth, Credentials};
pub use backends::Backends;
pub use config::{env_var, ClientConfig, ResolvedClientConfig};
pub use connector::{Connector, Dispatcher};
pub use deadline::Deadline;
pub use error::{ConnectError, ProxyError};
pub use forwarding_proxy::{ForwardingProxy, ProxyBody, ProxyOptions};
pub use tcp_proxy::TcpProxy;
