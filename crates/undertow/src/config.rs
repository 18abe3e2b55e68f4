//! Client configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Environment variables (UNDERTOW_*)
//! 2. Config file (client.toml)
//! 3. Default values (where applicable)
//!
//! The backend map is only read from the config file.

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::Deserialize;

use undertow_common::{load_client_config_from_pem, parse_duration, resolve_pem, KeepAlive};

use crate::auth::Credentials;
use crate::backends::Backends;
use crate::connector::{Connector, Dispatcher};
use crate::forwarding_proxy::{ForwardingProxy, ProxyOptions};
use crate::tcp_proxy::TcpProxy;

/// Environment variable prefix
const ENV_PREFIX: &str = "UNDERTOW";

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Client configuration (parsed from TOML, can be overridden by env)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ClientConfig {
    /// Tunnel server address (host:port)
    pub server_addr: Option<String>,

    /// Client certificate (file path or inline PEM)
    #[serde(alias = "cert_path")]
    pub cert: Option<String>,

    /// Client private key (file path or inline PEM)
    #[serde(alias = "key_path")]
    pub key: Option<String>,

    /// CA certificate the server is verified against (file path or inline PEM)
    #[serde(alias = "ca_cert_path")]
    pub ca_cert: Option<String>,

    /// Backend for streams the map does not match
    pub backend: Option<String>,

    /// Backends keyed by `host:port`, `port`, `0.0.0.0:port` or `host`
    pub backends: HashMap<String, String>,

    pub proxy_user: Option<String>,
    pub proxy_password: Option<String>,

    /// e.g. "10s"
    pub dial_timeout: Option<String>,
    pub read_timeout: Option<String>,
    pub write_timeout: Option<String>,

    /// Keep-alive options for the server connection, or "off"
    pub keepalive: Option<String>,

    /// Fixed delay between connection attempts
    pub reconnect_delay: Option<String>,
}

/// Resolved client configuration with actual PEM content
#[derive(Debug)]
pub struct ResolvedClientConfig {
    pub server_addr: String,
    pub cert_pem: String,
    pub key_pem: String,
    pub ca_cert_pem: String,
    pub backends: Backends,
    pub proxy: ProxyOptions,
    pub keepalive: Option<KeepAlive>,
    pub reconnect_delay: Duration,
}

/// Value of the `UNDERTOW_<name>` environment variable
pub fn env_var(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

impl ClientConfig {
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
    pub fn resolve(self) -> anyhow::Result<ResolvedClientConfig> {
        self.resolve_with(env_var)
    }

    /// Resolve with `lookup` returning overrides by unprefixed name
    pub fn resolve_with(
        self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<ResolvedClientConfig> {
        let server_addr = lookup("SERVER_ADDR")
            .or(self.server_addr)
            .filter(|addr| !addr.is_empty())
            .ok_or_else(|| {
                anyhow!("server_addr required. Set UNDERTOW_SERVER_ADDR or server_addr in config")
            })?;

        let cert_pem = required_pem(lookup("CERT").or(self.cert), "cert", "UNDERTOW_CERT")?;
        let key_pem = required_pem(lookup("KEY").or(self.key), "key", "UNDERTOW_KEY")?;
        let ca_cert_pem =
            required_pem(lookup("CA_CERT").or(self.ca_cert), "ca_cert", "UNDERTOW_CA_CERT")?;

        let backend = lookup("BACKEND")
            .or(self.backend)
            .filter(|addr| !addr.is_empty());
        let backends = Backends::new(backend, self.backends);
        if backends.is_empty() {
            tracing::warn!("No backends configured; every routed stream will fail");
        }

        let credentials = Credentials::new(
            lookup("PROXY_USER").or(self.proxy_user),
            lookup("PROXY_PASSWORD").or(self.proxy_password),
        );
        let dial_timeout =
            optional_duration(lookup("DIAL_TIMEOUT").or(self.dial_timeout), "dial_timeout")?;
        let proxy = ProxyOptions {
            credentials,
            dial_timeout: dial_timeout.unwrap_or(DEFAULT_DIAL_TIMEOUT),
            read_timeout: optional_duration(
                lookup("READ_TIMEOUT").or(self.read_timeout),
                "read_timeout",
            )?,
            write_timeout: optional_duration(
                lookup("WRITE_TIMEOUT").or(self.write_timeout),
                "write_timeout",
            )?,
        };

        let keepalive = match lookup("KEEPALIVE").or(self.keepalive) {
            Some(value) if value == "off" => None,
            Some(value) => Some(value.parse().context("Invalid keepalive")?),
            None => Some(KeepAlive::default()),
        };

        let reconnect_delay = optional_duration(
            lookup("RECONNECT_DELAY").or(self.reconnect_delay),
            "reconnect_delay",
        )?
        .unwrap_or(DEFAULT_RECONNECT_DELAY);

        Ok(ResolvedClientConfig {
            server_addr,
            cert_pem,
            key_pem,
            ca_cert_pem,
            backends,
            proxy,
            keepalive,
            reconnect_delay,
        })
    }
}

impl ResolvedClientConfig {
    /// Build the TLS configuration and the proxies behind one connector
    pub fn connector(&self) -> anyhow::Result<Connector> {
        let tls = load_client_config_from_pem(&self.cert_pem, &self.key_pem, &self.ca_cert_pem)
            .context("Failed to load TLS configuration")?;

        let dispatcher = Dispatcher::new(
            ForwardingProxy::new(self.backends.clone(), self.proxy.clone()),
            Arc::new(TcpProxy::new(self.backends.clone(), self.proxy.dial_timeout)),
        );

        Ok(Connector::new(
            self.server_addr.clone(),
            Arc::new(tls),
            self.keepalive,
            dispatcher,
        )?)
    }
}

fn required_pem(source: Option<String>, field: &str, var: &str) -> anyhow::Result<String> {
    let source =
        source.ok_or_else(|| anyhow!("{} required. Set {} or {} in config", field, var, field))?;
    resolve_pem(&source).with_context(|| format!("Failed to resolve {}", field))
}

fn optional_duration(value: Option<String>, field: &str) -> anyhow::Result<Option<Duration>> {
    value
        .filter(|value| !value.is_empty())
        .map(|value| parse_duration(&value).with_context(|| format!("Invalid {}", field)))
        .transpose()
}
