//! Test server harness for E2E tests
//!
//! Starts a complete tunnel server on ephemeral ports, with generated
//! certificates and the test client allowed under [`CLIENT_HOST`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use undertow_common::load_server_config_from_pem;
use undertow_protocol::Protocol;
use undertow_server::{AllowedClient, ListenerBinding, Registry, ServerSettings, TunnelServer};

use crate::certificates::TestCertificates;

/// Host the test client's connection is registered under
pub const CLIENT_HOST: &str = "app.example";

/// How long helpers wait for the tunnel to change state
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// A running test server instance
pub struct TestServer {
    server: TunnelServer,
    pub certs: Arc<TestCertificates>,
}

impl TestServer {
    /// Start a server whose client owns one public listener per protocol
    pub async fn start(listeners: &[Protocol]) -> Self {
        let certs = Arc::new(TestCertificates::generate());
        let tls = load_server_config_from_pem(
            &certs.server.cert_pem,
            &certs.server.key_pem,
            &certs.ca_cert_pem,
        )
        .expect("Failed to load server TLS config");

        let client = AllowedClient {
            id: certs.client.identity(),
            host: CLIENT_HOST.to_string(),
            listeners: listeners
                .iter()
                .map(|&protocol| ListenerBinding {
                    addr: ephemeral(),
                    protocol,
                })
                .collect(),
        };

        let server = TunnelServer::start(ServerSettings {
            control_addr: ephemeral(),
            http_addr: Some(ephemeral()),
            tls: Arc::new(tls),
            clients: vec![client],
            handshake_timeout: Duration::from_secs(2),
            keepalive: None,
        })
        .await
        .expect("Failed to start server");

        Self { server, certs }
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.server.addr()
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.server.http_addr().expect("HTTP entry point enabled")
    }

    /// Address of the client's `index`th public listener
    pub fn listener_addr(&self, index: usize) -> SocketAddr {
        self.server.listener_addrs()[index].1
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.server.registry()
    }

    /// Wait until a live connection is registered for `host`
    pub async fn wait_registered(&self, host: &str) {
        let registry = self.registry().clone();
        let wait = async {
            while registry.resolve(host).is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(WAIT_TIMEOUT, wait)
            .await
            .unwrap_or_else(|_| panic!("{} was never registered", host));
    }

    pub async fn shutdown(self) {
        self.server.shutdown().await;
    }
}

fn ephemeral() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}
