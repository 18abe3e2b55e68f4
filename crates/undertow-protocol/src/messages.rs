use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::codec::ProtocolError;

/// What the client is asked to do with a routed stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Serve one public connection over a new logical stream
    RequestClientSession,
}

impl Action {
    pub const ALL: [Action; 1] = [Action::RequestClientSession];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::RequestClientSession => "client-session",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client-session" => Ok(Action::RequestClientSession),
            other => Err(ProtocolError::UnknownAction(other.to_string())),
        }
    }
}

/// Protocol spoken by the public side of a routed stream
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    /// HTTP/1.1 request received on the HTTP entry point
    Http,
    /// CONNECT-style proxy tunnel request
    HttpConnect,
    /// Raw TCP accepted on a client listener
    Tcp,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Http, Protocol::HttpConnect, Protocol::Tcp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::HttpConnect => "http-connect",
            Protocol::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Protocol::Http),
            "http-connect" => Ok(Protocol::HttpConnect),
            "tcp" => Ok(Protocol::Tcp),
            other => Err(ProtocolError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Routing metadata attached to every logical stream
///
/// Built by the server once per public connection and carried as header
/// fields of the stream's request. Empty strings mean "not set".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub action: Action,
    pub protocol: Protocol,
    /// Host the public caller asked for (Host header or listener address)
    pub forwarded_host: String,
    /// Public peer address, `ip:port`
    pub forwarded_for: String,
    /// Address or host that accepted the public connection
    pub forwarded_by: String,
    /// Request path, HTTP only
    pub url_path: String,
    /// Public peer IP, used for X-Forwarded-For on the client side
    pub remote_addr: String,
}

impl ControlMessage {
    /// A session request for `protocol` with every routing field unset
    pub fn session(protocol: Protocol) -> Self {
        Self {
            action: Action::RequestClientSession,
            protocol,
            forwarded_host: String::new(),
            forwarded_for: String::new(),
            forwarded_by: String::new(),
            url_path: String::new(),
            remote_addr: String::new(),
        }
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} for={} by={}",
            self.action, self.protocol, self.forwarded_for, self.forwarded_by
        )?;
        if !self.forwarded_host.is_empty() {
            write!(f, " host={}", self.forwarded_host)?;
        }
        if !self.url_path.is_empty() {
            write!(f, " path={}", self.url_path)?;
        }
        Ok(())
    }
}
