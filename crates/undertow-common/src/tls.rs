use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use crate::TunnelError;

/// ALPN identifier of the multiplexed tunnel protocol
pub const TUNNEL_ALPN: &[u8] = b"h2";

const PEM_MARKER: &str = "-----BEGIN";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Resolve a configured PEM source: inline PEM content or a file path
pub fn resolve_pem(source: &str) -> Result<String, TunnelError> {
    let source = source.trim();
    if source.contains(PEM_MARKER) {
        return Ok(source.to_string());
    }
    read_pem_file(Path::new(source))
}

fn read_pem_file(path: &Path) -> Result<String, TunnelError> {
    fs::read_to_string(path)
        .map_err(|e| TunnelError::Certificate(format!("Failed to open {:?}: {}", path, e)))
}

/// Load certificates from PEM content
pub fn load_certs_from_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>, TunnelError> {
    let certs = certs(&mut Cursor::new(pem.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::Certificate(format!("Failed to parse certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(TunnelError::Certificate(
            "No certificate found in PEM content".to_string(),
        ));
    }
    Ok(certs)
}

fn load_private_key_from_pem(pem: &str) -> Result<PrivateKeyDer<'static>, TunnelError> {
    private_key(&mut Cursor::new(pem.as_bytes()))
        .map_err(|e| TunnelError::Certificate(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| TunnelError::Certificate("No private key found in PEM content".to_string()))
}

fn load_root_store_from_pem(pem: &str) -> Result<RootCertStore, TunnelError> {
    let mut root_store = RootCertStore::empty();
    for cert in load_certs_from_pem(pem)? {
        root_store.add(cert).map_err(|e| {
            TunnelError::Certificate(format!("Failed to add CA certificate: {}", e))
        })?;
    }
    Ok(root_store)
}

/// Server TLS config that requires a client certificate signed by `ca_pem`
///
/// Only HTTP/2 is negotiated: every control connection carries a multiplexed
/// transport.
pub fn load_server_config_from_pem(
    cert_pem: &str,
    key_pem: &str,
    ca_pem: &str,
) -> Result<ServerConfig, TunnelError> {
    let certs = load_certs_from_pem(cert_pem)?;
    let key = load_private_key_from_pem(key_pem)?;
    let root_store = load_root_store_from_pem(ca_pem)?;

    let provider = provider();
    let client_verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(root_store), provider.clone())
            .build()
            .map_err(|e| TunnelError::Tls(format!("Failed to build client verifier: {}", e)))?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TunnelError::Tls(format!("Unsupported protocol versions: {}", e)))?
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(certs, key)
        .map_err(|e| TunnelError::Tls(format!("Failed to build server config: {}", e)))?;
    config.alpn_protocols = vec![TUNNEL_ALPN.to_vec()];

    Ok(config)
}

/// Client TLS config presenting `cert_pem` and trusting servers signed by `ca_pem`
pub fn load_client_config_from_pem(
    cert_pem: &str,
    key_pem: &str,
    ca_pem: &str,
) -> Result<ClientConfig, TunnelError> {
    let certs = load_certs_from_pem(cert_pem)?;
    let key = load_private_key_from_pem(key_pem)?;
    let root_store = load_root_store_from_pem(ca_pem)?;

    let mut config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TunnelError::Tls(format!("Unsupported protocol versions: {}", e)))?
        .with_root_certificates(root_store)
        .with_client_auth_cert(certs, key)
        .map_err(|e| TunnelError::Tls(format!("Failed to build client config: {}", e)))?;
    config.alpn_protocols = vec![TUNNEL_ALPN.to_vec()];

    Ok(config)
}
