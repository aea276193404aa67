//! TLS credential material
//!
//! The hub cannot run a single secure transport without its CA certificate,
//! certificate chain and private key, so every failure here is a
//! [`ConfigError`] and fatal at startup. The same rustls server configuration
//! (TLS 1.3, client certificates required and verified against the CA) backs
//! both the WebSocket and the QUIC protocol servers.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tracing::info;

use crate::config::{CredentialPaths, DEFAULT_CA_FILE, DEFAULT_CERT_FILE, DEFAULT_KEY_FILE};
use crate::errors::{ConfigError, CredentialKind, MissingCredential};

// ----------------------------------------------------------------------------
// Credential Material
// ----------------------------------------------------------------------------

/// PEM-encoded CA certificate, server certificate chain and server private key
#[derive(Clone)]
pub struct TlsMaterial {
    ca: Vec<u8>,
    cert: Vec<u8>,
    key: Vec<u8>,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca_bytes", &self.ca.len())
            .field("cert_bytes", &self.cert.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

impl TlsMaterial {
    /// Wrap credential bytes supplied by a configuration collaborator
    pub fn new(ca: Vec<u8>, cert: Vec<u8>, key: Vec<u8>) -> Self {
        Self { ca, cert, key }
    }

    /// Read all three credential files, reporting every unreadable one at once
    pub fn load(paths: &CredentialPaths) -> Result<Self, ConfigError> {
        let ca_path = resolve_path(&paths.ca, DEFAULT_CA_FILE, "ca");
        let cert_path = resolve_path(&paths.cert, DEFAULT_CERT_FILE, "cert");
        let key_path = resolve_path(&paths.key, DEFAULT_KEY_FILE, "key");

        let mut missing = Vec::new();
        let ca = read_credential(CredentialKind::CaCertificate, &ca_path, &mut missing);
        let cert = read_credential(CredentialKind::ServerCertificate, &cert_path, &mut missing);
        let key = read_credential(CredentialKind::PrivateKey, &key_path, &mut missing);

        match (ca, cert, key) {
            (Some(ca), Some(cert), Some(key)) if missing.is_empty() => {
                let material = Self::new(ca, cert, key);
                material.validate()?;
                Ok(material)
            }
            _ => Err(ConfigError::MissingCredentials { missing }),
        }
    }

    /// Check that every blob is present
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (kind, bytes) in [
            (CredentialKind::CaCertificate, &self.ca),
            (CredentialKind::ServerCertificate, &self.cert),
            (CredentialKind::PrivateKey, &self.key),
        ] {
            if bytes.iter().all(u8::is_ascii_whitespace) {
                return Err(ConfigError::EmptyCredential { kind });
            }
        }
        Ok(())
    }

    pub fn ca_pem(&self) -> &[u8] {
        &self.ca
    }

    pub fn cert_pem(&self) -> &[u8] {
        &self.cert
    }

    /// Build the shared rustls server configuration requiring client certificates
    pub fn server_config(&self, alpn: &[String]) -> Result<Arc<rustls::ServerConfig>, ConfigError> {
        self.validate()?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let chain = parse_certificates(CredentialKind::ServerCertificate, &self.cert)?;
        let key = parse_private_key(&self.key)?;

        let mut roots = RootCertStore::empty();
        for ca in parse_certificates(CredentialKind::CaCertificate, &self.ca)? {
            roots.add(ca).map_err(|e| ConfigError::InvalidCredential {
                kind: CredentialKind::CaCertificate,
                reason: e.to_string(),
            })?;
        }

        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .map_err(|e| ConfigError::InvalidCredential {
                kind: CredentialKind::CaCertificate,
                reason: e.to_string(),
            })?;

        let mut config = rustls::ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, key)?;
        config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        config.max_early_data_size = 0;

        Ok(Arc::new(config))
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn resolve_path(configured: &Option<PathBuf>, default: &str, key: &str) -> PathBuf {
    match configured {
        Some(path) => path.clone(),
        None => {
            info!(
                "missing credentials.{} configuration key, loading default path {}",
                key, default
            );
            PathBuf::from(default)
        }
    }
}

fn read_credential(
    kind: CredentialKind,
    path: &Path,
    missing: &mut Vec<MissingCredential>,
) -> Option<Vec<u8>> {
    match std::fs::read(path) {
        Ok(bytes) => Some(bytes),
        Err(source) => {
            missing.push(MissingCredential {
                kind,
                path: path.to_path_buf(),
                source,
            });
            None
        }
    }
}

fn parse_certificates(
    kind: CredentialKind,
    pem: &[u8],
) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::InvalidCredential {
            kind,
            reason: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(ConfigError::InvalidCredential {
            kind,
            reason: "no PEM certificate found".to_string(),
        });
    }
    Ok(certs)
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, ConfigError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| ConfigError::InvalidCredential {
            kind: CredentialKind::PrivateKey,
            reason: e.to_string(),
        })?
        .ok_or(ConfigError::InvalidCredential {
            kind: CredentialKind::PrivateKey,
            reason: "no PKCS#8, PKCS#1 or SEC1 key found".to_string(),
        })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed_material() -> TlsMaterial {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_pem = cert.serialize_pem().unwrap();
        let key_pem = cert.serialize_private_key_pem();
        TlsMaterial::new(
            cert_pem.clone().into_bytes(),
            cert_pem.into_bytes(),
            key_pem.into_bytes(),
        )
    }

    #[test]
    fn test_server_config_from_valid_material() {
        let material = self_signed_material();
        let config = material.server_config(&["cloudhub".to_string()]).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"cloudhub".to_vec()]);
    }

    #[test]
    fn test_garbage_material_is_rejected() {
        let good = self_signed_material();
        let bad_key = TlsMaterial::new(
            good.ca_pem().to_vec(),
            good.cert_pem().to_vec(),
            b"not a key".to_vec(),
        );
        assert!(matches!(
            bad_key.server_config(&[]),
            Err(ConfigError::InvalidCredential {
                kind: CredentialKind::PrivateKey,
                ..
            })
        ));

        let empty_ca = TlsMaterial::new(Vec::new(), good.cert_pem().to_vec(), b"k".to_vec());
        assert!(matches!(
            empty_ca.validate(),
            Err(ConfigError::EmptyCredential {
                kind: CredentialKind::CaCertificate
            })
        ));
    }

    #[test]
    fn test_load_reports_every_missing_file() {
        let dir = std::env::temp_dir().join(format!("cloudhub-missing-{}", std::process::id()));
        let paths = CredentialPaths {
            ca: Some(dir.join("ca.crt")),
            cert: Some(dir.join("server.crt")),
            key: Some(dir.join("server.key")),
        };

        match TlsMaterial::load(&paths) {
            Err(ConfigError::MissingCredentials { missing }) => {
                let kinds: Vec<_> = missing.iter().map(|m| m.kind).collect();
                assert_eq!(
                    kinds,
                    vec![
                        CredentialKind::CaCertificate,
                        CredentialKind::ServerCertificate,
                        CredentialKind::PrivateKey
                    ]
                );
            }
            other => panic!("expected missing credentials, got {:?}", other),
        }
    }

    #[test]
    fn test_load_reads_existing_files() {
        let material = self_signed_material();
        let dir = std::env::temp_dir().join(format!("cloudhub-creds-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("ca.crt"), material.ca_pem()).unwrap();
        std::fs::write(dir.join("server.crt"), material.cert_pem()).unwrap();
        std::fs::write(dir.join("server.key"), &material.key).unwrap();

        let loaded = TlsMaterial::load(&CredentialPaths {
            ca: Some(dir.join("ca.crt")),
            cert: Some(dir.join("server.crt")),
            key: Some(dir.join("server.key")),
        })
        .unwrap();
        assert_eq!(loaded.cert_pem(), material.cert_pem());

        std::fs::remove_dir_all(&dir).ok();
    }
}
