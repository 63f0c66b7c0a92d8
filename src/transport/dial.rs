//! Outbound TLS connections and upgrade tunnels

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::common::{Error, Result};

use super::Cert;

/// A buffered, established tunnel connection.
pub type Conn = BufReader<TlsStream<TcpStream>>;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Establish a secure connection with the given server.
pub async fn dial(cert: &Cert, addr: &str) -> Result<TlsStream<TcpStream>> {
    let tcp = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await?
        .map_err(|e| Error::Transport(format!("connect to {}: {}", addr, e)))?;

    let connector = TlsConnector::from(cert.client_config.clone());
    let stream = timeout(
        DIAL_TIMEOUT,
        connector.connect(cert.server_name.clone(), tcp),
    )
    .await?
    .map_err(|e| Error::Transport(format!("TLS handshake with {}: {}", addr, e)))?;

    Ok(stream)
}

/// Dial a peer and switch the connection to the given upgrade protocol.
///
/// Writes an HTTP/1.1 request with `Upgrade: <protocol>` plus any extra
/// headers, then expects a `101 Switching Protocols` response echoing the
/// protocol back. The returned connection carries raw tunnel traffic.
pub async fn upgrade(
    cert: &Cert,
    addr: &str,
    method: &str,
    path: &str,
    protocol: &str,
    headers: &[(&str, String)],
) -> Result<Conn> {
    let stream = dial(cert, addr).await?;
    let mut conn = BufReader::new(stream);

    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nUpgrade: {}\r\nConnection: Upgrade\r\n",
        method, path, addr, protocol
    );
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");

    conn.write_all(request.as_bytes()).await?;
    conn.flush().await?;

    let mut status = String::new();
    timeout(DIAL_TIMEOUT, conn.read_line(&mut status)).await??;
    if !status.contains(" 101 ") {
        return Err(Error::Transport(format!(
            "expected status code 101, got {:?}",
            status.trim()
        )));
    }

    // Drain response headers, checking the Upgrade echo.
    let mut upgraded = false;
    loop {
        let mut line = String::new();
        timeout(DIAL_TIMEOUT, conn.read_line(&mut line)).await??;
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("upgrade") && value.trim() == protocol {
                upgraded = true;
            }
        }
    }
    if !upgraded {
        return Err(Error::Transport(
            "missing or unexpected Upgrade header in response".into(),
        ));
    }

    Ok(conn)
}
