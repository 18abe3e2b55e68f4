use std::fmt;
use std::str::FromStr;

use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};

use crate::tls::load_certs_from_pem;
use crate::TunnelError;

const DIGEST_LEN: usize = 32;
const GROUP_LEN: usize = 4;

/// Identity of a tunnel client: SHA-256 fingerprint of its leaf certificate
///
/// Displayed as uppercase hex in dash separated groups of four bytes. Parsing
/// accepts any case and ignores `-` and `:` separators.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientIdentity([u8; DIGEST_LEN]);

impl ClientIdentity {
    pub fn from_certificate(cert: &CertificateDer<'_>) -> Self {
        Self(Sha256::digest(cert.as_ref()).into())
    }

    /// Identity of the first certificate in a PEM bundle
    pub fn from_pem(pem: &str) -> Result<Self, TunnelError> {
        let certs = load_certs_from_pem(pem)?;
        certs
            .first()
            .map(Self::from_certificate)
            .ok_or_else(|| TunnelError::Identity("no certificate in PEM content".to_string()))
    }

    /// Identity of the peer of an accepted TLS connection
    pub fn from_tls<S>(stream: &tokio_rustls::server::TlsStream<S>) -> Result<Self, TunnelError> {
        let (_, conn) = stream.get_ref();
        conn.peer_certificates()
            .and_then(|certs| certs.first())
            .map(Self::from_certificate)
            .ok_or_else(|| TunnelError::Identity("peer presented no certificate".to_string()))
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let groups: Vec<String> = self.0.chunks(GROUP_LEN).map(hex::encode_upper).collect();
        f.write_str(&groups.join("-"))
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientIdentity({})", self)
    }
}

impl FromStr for ClientIdentity {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|c| !matches!(c, '-' | ':')).collect();

        let mut out = [0u8; DIGEST_LEN];
        hex::decode_to_slice(&digits, &mut out)
            .map_err(|e| TunnelError::Identity(format!("invalid identity {:?}: {}", s, e)))?;
        Ok(Self(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_then_parse() {
        let id = ClientIdentity::from_certificate(&CertificateDer::from(vec![1u8, 2, 3]));
        let shown = id.to_string();

        assert_eq!(shown.len(), 64 + 7);
        assert_eq!(shown, shown.to_uppercase());
        assert_eq!(shown.parse::<ClientIdentity>().unwrap(), id);
    }

    #[test]
    fn test_parse_accepts_colons_and_lowercase() {
        let id = ClientIdentity::from_certificate(&CertificateDer::from(b"cert".to_vec()));
        let colons = id
            .as_bytes()
            .iter()
            .map(|b| hex::encode([*b]))
            .collect::<Vec<_>>()
            .join(":");

        assert_eq!(colons.parse::<ClientIdentity>().unwrap(), id);
    }

    #[test]
    fn test_distinct_certificates_differ() {
        let a = ClientIdentity::from_certificate(&CertificateDer::from(b"a".to_vec()));
        let b = ClientIdentity::from_certificate(&CertificateDer::from(b"b".to_vec()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("".parse::<ClientIdentity>().is_err());
        assert!("ABCD".parse::<ClientIdentity>().is_err());
        assert!("Z".repeat(64).parse::<ClientIdentity>().is_err());
        // One byte short, and one byte over
        assert!("AB".repeat(31).parse::<ClientIdentity>().is_err());
        assert!("AB".repeat(33).parse::<ClientIdentity>().is_err());
    }
}
