//! Shared test utilities: a throwaway CA with server and client certificates

use std::net::SocketAddr;
use std::sync::Arc;

use cloudhub_core::TlsMaterial;
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::RootCertStore;

/// CA-signed credentials for the hub and for one edge client
pub struct TestPki {
    pub material: TlsMaterial,
    ca_der: Vec<u8>,
    client_der: Vec<u8>,
    client_key_der: Vec<u8>,
}

impl TestPki {
    pub fn generate() -> Self {
        let mut ca_params = CertificateParams::new(Vec::new());
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "cloudhub test CA");
        let ca = Certificate::from_params(ca_params).unwrap();

        let server =
            Certificate::from_params(CertificateParams::new(vec!["localhost".to_string()]))
                .unwrap();
        let client =
            Certificate::from_params(CertificateParams::new(vec!["edge.local".to_string()]))
                .unwrap();

        let material = TlsMaterial::new(
            ca.serialize_pem().unwrap().into_bytes(),
            server.serialize_pem_with_signer(&ca).unwrap().into_bytes(),
            server.serialize_private_key_pem().into_bytes(),
        );

        Self {
            material,
            ca_der: ca.serialize_der().unwrap(),
            client_der: client.serialize_der_with_signer(&ca).unwrap(),
            client_key_der: client.serialize_private_key_der(),
        }
    }

    /// TLS 1.3 client trusting the test CA, presenting the client
    /// certificate only when `with_cert` is set
    pub fn client_config(&self, with_cert: bool, alpn: &[&str]) -> Arc<rustls::ClientConfig> {
        let mut roots = RootCertStore::empty();
        roots.add(CertificateDer::from(self.ca_der.clone())).unwrap();

        let builder = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .unwrap()
        .with_root_certificates(roots);

        let mut config = if with_cert {
            let chain = vec![CertificateDer::from(self.client_der.clone())];
            let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.client_key_der.clone()));
            builder.with_client_auth_cert(chain, key).unwrap()
        } else {
            builder.with_no_client_auth()
        };
        config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        Arc::new(config)
    }
}

/// A loopback TCP address that was free a moment ago
pub fn free_tcp_addr() -> SocketAddr {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
}
