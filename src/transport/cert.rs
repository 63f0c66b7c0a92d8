//! Cluster certificate loading

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

use crate::common::{Error, Result};

/// TLS configuration shared by every cluster connection.
pub struct Cert {
    pub server_config: Arc<ServerConfig>,
    pub client_config: Arc<ClientConfig>,
    /// Expected peer name, taken from the certificate's first DNS SAN.
    pub server_name: ServerName<'static>,
}

/// Load the cluster TLS certificates from the given directory.
///
/// Expects `cluster.crt` and `cluster.key`. The certificate doubles as the
/// trust pool: only peers presenting the same chain are accepted, and client
/// certificates are required.
pub fn load_cert(dir: impl AsRef<Path>) -> Result<Cert> {
    let dir = dir.as_ref();
    let crt_path = dir.join("cluster.crt");
    let key_path = dir.join("cluster.key");

    let crt_pem = std::fs::read(&crt_path)?;
    let key_pem = std::fs::read(&key_path)?;

    let certs = rustls_pemfile::certs(&mut crt_pem.as_slice())
        .collect::<std::io::Result<Vec<CertificateDer<'static>>>>()?;
    if certs.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "no certificate found in {}",
            crt_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())?
        .ok_or_else(|| {
            Error::InvalidConfig(format!("no private key found in {}", key_path.display()))
        })?;

    let mut roots = RootCertStore::empty();
    for cert in &certs {
        roots
            .add(cert.clone())
            .map_err(|e| Error::InvalidConfig(format!("bad certificate: {}", e)))?;
    }
    let roots = Arc::new(roots);

    let server_name = first_dns_san(&certs[0])?;

    let verifier = WebPkiClientVerifier::builder(roots.clone())
        .build()
        .map_err(|e| Error::InvalidConfig(format!("client verifier: {}", e)))?;

    let server_config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs.clone(), key.clone_key())?;

    let client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)?;

    Ok(Cert {
        server_config: Arc::new(server_config),
        client_config: Arc::new(client_config),
        server_name,
    })
}

/// The certificate's first DNS SAN, used as the expected server name.
fn first_dns_san(cert: &CertificateDer<'_>) -> Result<ServerName<'static>> {
    let (_, parsed) = x509_parser::certificate::X509Certificate::from_der(cert.as_ref())
        .map_err(|e| Error::InvalidConfig(format!("parse certificate: {}", e)))?;

    for ext in parsed.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                if let GeneralName::DNSName(dns) = name {
                    return ServerName::try_from(dns.to_string()).map_err(|e| {
                        Error::InvalidConfig(format!("bad DNS name in certificate: {}", e))
                    });
                }
            }
        }
    }

    Err(Error::InvalidConfig(
        "certificate has no DNS subject alternative name".into(),
    ))
}
