//! Test certificate generation using rcgen
//!
//! Certificates are generated at runtime, so tests never depend on
//! checked-in key material.

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use undertow_common::ClientIdentity;

/// A certificate and its private key
#[derive(Clone)]
pub struct CertifiedKey {
    pub cert_pem: String,
    pub key_pem: String,
}

impl CertifiedKey {
    /// Identity the server derives from this certificate
    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity::from_pem(&self.cert_pem).expect("Failed to read test certificate")
    }
}

/// A CA and the certificates it signed
#[derive(Clone)]
pub struct TestCertificates {
    pub ca_cert_pem: String,
    /// Valid for `localhost`, 127.0.0.1 and ::1
    pub server: CertifiedKey,
    /// The client the test server allows
    pub client: CertifiedKey,
    /// Signed by the same CA but not in the server's client list
    pub stranger: CertifiedKey,
}

impl TestCertificates {
    pub fn generate() -> Self {
        let ca_key = KeyPair::generate().expect("Failed to generate CA key");

        let mut ca_params = CertificateParams::default();
        ca_params.distinguished_name = name("Undertow Test CA");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let ca_cert = ca_params
            .clone()
            .self_signed(&ca_key)
            .expect("Failed to create CA cert");
        let ca = Issuer::new(ca_params, ca_key);

        let mut server_params = CertificateParams::default();
        server_params.distinguished_name = name("localhost");
        server_params.subject_alt_names = vec![
            SanType::DnsName("localhost".try_into().expect("valid DNS name")),
            SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)),
        ];
        server_params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        Self {
            ca_cert_pem: ca_cert.pem(),
            server: sign(server_params, &ca),
            client: sign(client_params("test-client"), &ca),
            stranger: sign(client_params("stranger"), &ca),
        }
    }
}

fn name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn
}

fn client_params(common_name: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name = name(common_name);
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    params
}

fn sign(params: CertificateParams, ca: &Issuer<'_, KeyPair>) -> CertifiedKey {
    let key = KeyPair::generate().expect("Failed to generate key");
    let cert = params.signed_by(&key, ca).expect("Failed to sign cert");
    CertifiedKey {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    }
}
