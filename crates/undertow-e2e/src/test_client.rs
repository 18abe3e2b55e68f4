//! Tunnel client for E2E tests
//!
//! Runs the real [`Connector`] against a [`TestServer`] in a background task.

use std::sync::Arc;

use tokio::task::JoinHandle;

use undertow::{
    Backends, ConnectError, Connector, Dispatcher, ForwardingProxy, ProxyOptions, TcpProxy,
};
use undertow_common::load_client_config_from_pem;

use crate::certificates::CertifiedKey;
use crate::harness::{TestServer, CLIENT_HOST};

/// A connected test client; the connection is dropped with it
pub struct TestClient {
    handle: JoinHandle<Result<(), ConnectError>>,
}

impl TestClient {
    /// Connect as the allowed client and wait until the server routes to it
    pub async fn connect(server: &TestServer, backends: Backends, options: ProxyOptions) -> Self {
        let connector = connector(server, &server.certs.client, backends, options);
        let client = Self {
            handle: tokio::spawn(async move { connector.run().await }),
        };
        server.wait_registered(CLIENT_HOST).await;
        client
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Connector presenting `identity` to the test server
pub fn connector(
    server: &TestServer,
    identity: &CertifiedKey,
    backends: Backends,
    options: ProxyOptions,
) -> Connector {
    let tls = load_client_config_from_pem(
        &identity.cert_pem,
        &identity.key_pem,
        &server.certs.ca_cert_pem,
    )
    .expect("Failed to load client TLS config");

    let dispatcher = Dispatcher::new(
        ForwardingProxy::new(backends.clone(), options.clone()),
        Arc::new(TcpProxy::new(backends, options.dial_timeout)),
    );

    Connector::new(
        server.control_addr().to_string(),
        Arc::new(tls),
        None,
        dispatcher,
    )
    .expect("Failed to build connector")
}
