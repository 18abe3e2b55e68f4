//! Server configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Environment variables (UNDERTOW_*)
//! 2. Config file (server.toml)
//! 3. Default values (where applicable)
//!
//! Allowed clients and their listeners are only read from the config file.

use std::collections::HashSet;
use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use serde::Deserialize;

use undertow_common::{load_server_config_from_pem, parse_duration, resolve_pem, KeepAlive};
use undertow_protocol::Protocol;

use crate::registry::host_key;
use crate::{AllowedClient, ListenerBinding, ServerSettings};

/// Environment variable prefix
const ENV_PREFIX: &str = "UNDERTOW";

const DEFAULT_CONTROL_ADDR: &str = "0.0.0.0:4443";
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Server configuration (parsed from TOML, can be overridden by env)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Address for client control connections (mTLS)
    pub control_addr: Option<String>,

    /// Address of the public HTTP entry point; disabled when unset
    pub http_addr: Option<String>,

    /// Server certificate (file path or inline PEM)
    #[serde(alias = "cert_path")]
    pub cert: Option<String>,

    /// Server private key (file path or inline PEM)
    #[serde(alias = "key_path")]
    pub key: Option<String>,

    /// CA certificate for client verification (file path or inline PEM)
    #[serde(alias = "ca_cert_path")]
    pub ca_cert: Option<String>,

    /// Bound on the TLS handshake and the registration probe, e.g. "10s"
    pub handshake_timeout: Option<String>,

    /// Keep-alive options for control connections, e.g.
    /// "idle_time=1m,count=5,interval=5s", or "off"
    pub keepalive: Option<String>,

    pub clients: Vec<ClientConfig>,
}

/// One allowed client
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ClientConfig {
    /// Certificate identity, as printed by `undertow id`
    pub id: String,

    /// Host the client's connection is routed under
    pub host: String,

    pub listeners: Vec<ListenerConfig>,
}

/// A public listener relayed to its client
#[derive(Debug, Deserialize)]
pub struct ListenerConfig {
    pub addr: String,

    /// "tcp" (default), "http" or "http-connect"
    #[serde(default = "default_listener_protocol")]
    pub protocol: String,
}

fn default_listener_protocol() -> String {
    Protocol::Tcp.to_string()
}

/// Resolved server configuration with actual PEM content
#[derive(Debug)]
pub struct ResolvedServerConfig {
    pub control_addr: SocketAddr,
    pub http_addr: Option<SocketAddr>,
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_cert_pem: String,
    pub handshake_timeout: Duration,
    pub keepalive: Option<KeepAlive>,
    pub clients: Vec<AllowedClient>,
}

impl ServerConfig {
    /// Load configuration from a TOML file (optional)
    pub fn load(path: &str) -> Self {
        if Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => {
                        tracing::info!(path, "Loaded config");
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!(path, error = %e, "Failed to parse config");
                    }
                },
                Err(e) => {
                    tracing::warn!(path, error = %e, "Failed to read config");
                }
            }
        }
        Self::default()
    }

    /// Resolve configuration from environment variables first, then config file
    pub fn resolve(self) -> anyhow::Result<ResolvedServerConfig> {
        self.resolve_with(|name| env::var(format!("{}_{}", ENV_PREFIX, name)).ok())
    }

    /// Resolve with `lookup` returning environment overrides by unprefixed name
    pub fn resolve_with(
        self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<ResolvedServerConfig> {
        // Control address: ENV > config > default
        let control_addr = lookup("CONTROL_ADDR")
            .or(self.control_addr)
            .unwrap_or_else(|| DEFAULT_CONTROL_ADDR.to_string());
        let control_addr = parse_addr(&control_addr, "control_addr")?;

        // HTTP entry point: ENV > config > disabled
        let http_addr = lookup("HTTP_ADDR")
            .or(self.http_addr)
            .filter(|addr| !addr.is_empty())
            .map(|addr| parse_addr(&addr, "http_addr"))
            .transpose()?;

        // TLS material: ENV > config > required
        let cert_pem = required_pem(lookup("CERT").or(self.cert), "cert", "UNDERTOW_CERT")?;
        let key_pem = required_pem(lookup("KEY").or(self.key), "key", "UNDERTOW_KEY")?;
        let ca_cert_pem =
            required_pem(lookup("CA_CERT").or(self.ca_cert), "ca_cert", "UNDERTOW_CA_CERT")?;

        let handshake_timeout = match lookup("HANDSHAKE_TIMEOUT").or(self.handshake_timeout) {
            Some(value) => parse_duration(&value).context("Invalid handshake_timeout")?,
            None => DEFAULT_HANDSHAKE_TIMEOUT,
        };

        let keepalive = match lookup("KEEPALIVE").or(self.keepalive) {
            Some(value) if value == "off" => None,
            Some(value) => Some(value.parse().context("Invalid keepalive")?),
            None => Some(KeepAlive::default()),
        };

        let clients = resolve_clients(self.clients)?;
        if clients.is_empty() {
            tracing::warn!("No clients configured; every control connection will be rejected");
        }

        Ok(ResolvedServerConfig {
            control_addr,
            http_addr,
            cert_pem,
            key_pem,
            ca_cert_pem,
            handshake_timeout,
            keepalive,
            clients,
        })
    }

    /// Load config file and resolve with environment variable overrides
    pub fn load_and_resolve(path: &str) -> anyhow::Result<ResolvedServerConfig> {
        Self::load(path).resolve()
    }
}

impl ResolvedServerConfig {
    /// Build the TLS configuration and hand everything to the server
    pub fn into_settings(self) -> anyhow::Result<ServerSettings> {
        let tls = load_server_config_from_pem(&self.cert_pem, &self.key_pem, &self.ca_cert_pem)
            .context("Failed to load TLS configuration")?;

        Ok(ServerSettings {
            control_addr: self.control_addr,
            http_addr: self.http_addr,
            tls: Arc::new(tls),
            clients: self.clients,
            handshake_timeout: self.handshake_timeout,
            keepalive: self.keepalive,
        })
    }
}

fn parse_addr(value: &str, field: &str) -> anyhow::Result<SocketAddr> {
    value
        .parse()
        .with_context(|| format!("Invalid {}: {:?}", field, value))
}

fn required_pem(source: Option<String>, field: &str, var: &str) -> anyhow::Result<String> {
    let source =
        source.ok_or_else(|| anyhow!("{} required. Set {} or {} in config", field, var, field))?;
    resolve_pem(&source).with_context(|| format!("Failed to resolve {}", field))
}

fn resolve_clients(clients: Vec<ClientConfig>) -> anyhow::Result<Vec<AllowedClient>> {
    let mut hosts = HashSet::new();
    let mut resolved = Vec::with_capacity(clients.len());

    for client in clients {
        if client.host.is_empty() {
            bail!("Client {:?} has no host", client.id);
        }
        host_key(&client.host).with_context(|| {
            format!("Client host {:?} must be a bare host name", client.host)
        })?;
        if !hosts.insert(client.host.to_ascii_lowercase()) {
            bail!("Duplicate client host {:?}", client.host);
        }

        let id = client
            .id
            .parse()
            .with_context(|| format!("Invalid id for client {:?}", client.host))?;

        let listeners = client
            .listeners
            .iter()
            .map(|listener| -> anyhow::Result<ListenerBinding> {
                let protocol: Protocol = listener.protocol.parse().with_context(|| {
                    format!("Invalid listener protocol for client {:?}", client.host)
                })?;
                Ok(ListenerBinding {
                    addr: parse_addr(&listener.addr, "listener addr")?,
                    protocol,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        resolved.push(AllowedClient {
            id,
            host: client.host,
            listeners,
        });
    }
    Ok(resolved)
}
