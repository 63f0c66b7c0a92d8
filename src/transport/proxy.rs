//! Byte tunnel between an upgraded TLS connection and a unix socket

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

/// Copy data between the upgraded connection and the unix socket until both
/// directions finish.
///
/// When the TLS side reaches EOF the unix side is half-closed, so the engine
/// behind it observes a clean shutdown and can still flush pending replies.
/// Errors tear both directions down.
pub async fn proxy<S>(stream: S, unix: UnixStream)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut tls_rd, mut tls_wr) = tokio::io::split(stream);
    let (mut unix_rd, mut unix_wr) = unix.into_split();

    let inbound = tokio::spawn(async move {
        match tokio::io::copy(&mut tls_rd, &mut unix_wr).await {
            Ok(_) => {
                let _ = unix_wr.shutdown().await;
            }
            Err(err) => {
                tracing::debug!("tunnel remote -> unix: {}", err);
            }
        }
    });

    let outbound = tokio::spawn(async move {
        if let Err(err) = tokio::io::copy(&mut unix_rd, &mut tls_wr).await {
            tracing::debug!("tunnel unix -> remote: {}", err);
        }
        let _ = tls_wr.shutdown().await;
    });

    let _ = tokio::join!(inbound, outbound);
}
