//! Inbound TLS listener

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::common::{Error, Result};

use super::Cert;

/// Bind the given address and prepare to accept mutually-authenticated TLS
/// connections. Clients must present a certificate signed by the cluster
/// trust pool.
pub async fn listen(addr: &str, cert: &Cert) -> Result<(TcpListener, TlsAcceptor)> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Transport(format!("bind API address {}: {}", addr, e)))?;

    let acceptor = TlsAcceptor::from(cert.server_config.clone());

    Ok((listener, acceptor))
}
