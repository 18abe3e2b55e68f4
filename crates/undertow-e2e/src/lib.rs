//! End-to-end test utilities for the Undertow tunnel system
//!
//! Everything runs in-process on loopback ports: a real server, a real
//! client connector, and mock backends behind the client.

pub mod certificates;
pub mod harness;
pub mod mock_service;
pub mod mock_tcp_service;
pub mod test_client;

pub use certificates::{CertifiedKey, TestCertificates};
pub use harness::{TestServer, CLIENT_HOST, WAIT_TIMEOUT};
pub use mock_service::{MockHttpService, RecordedRequest};
pub use mock_tcp_service::MockTcpService;
pub use test_client::{connector, TestClient};

/// Install the crypto provider and a test-writer subscriber (idempotent)
pub fn init_test() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _ = tracing_subscriber::fmt()
        .with_env_filter("undertow=debug,undertow_server=debug,undertow_common=debug")
        .with_test_writer()
        .try_init();
}
