//! Cluster client
//!
//! Thin client for the node HTTP API: roster queries over plain HTTP and
//! watch subscriptions over the `/watch` upgrade tunnel.

pub mod notify;

pub use notify::Notifier;

use std::sync::Arc;

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

use crate::common::{Error, Result};
use crate::engine::NodeInfo;
use crate::transport::{self, Cert};
use crate::watch::WatchEvent;

pub struct Client {
    address: String,
    cert: Arc<Cert>,
}

impl Client {
    pub fn new(address: &str, cert: Arc<Cert>) -> Self {
        Self {
            address: address.to_string(),
            cert,
        }
    }

    /// Fetch the cluster roster from the node.
    pub async fn servers(&self) -> Result<Vec<NodeInfo>> {
        let stream = transport::dial(&self.cert, &self.address).await?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| Error::Transport(format!("HTTP handshake with {}: {}", self.address, e)))?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::debug!("cluster connection: {}", err);
            }
        });

        let request = hyper::Request::builder()
            .method(hyper::Method::GET)
            .uri("/cluster")
            .header(hyper::header::HOST, self.address.as_str())
            .body(Empty::<Bytes>::new())
            .map_err(|e| Error::Protocol(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| Error::Transport(format!("GET /cluster: {}", e)))?;
        if response.status() != hyper::StatusCode::OK {
            return Err(Error::Transport(format!(
                "unexpected status from /cluster: {}",
                response.status()
            )));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Transport(format!("read /cluster response: {}", e)))?
            .to_bytes();
        Ok(serde_json::from_slice(&body)?)
    }

    /// Subscribe to mutations of `key` (or a `prefix%`) starting at the
    /// given revision; 0 subscribes to future events only.
    ///
    /// The first frame on the returned channel is the `{Start:true}` marker.
    /// A fatal stream error surfaces as a final `{Err:...}` frame, after
    /// which the channel closes; reconnect with the last seen revision.
    pub async fn watch(&self, key: &str, revision: i64) -> Result<mpsc::Receiver<WatchEvent>> {
        let conn = transport::upgrade(
            &self.cert,
            &self.address,
            "GET",
            "/watch",
            "watch",
            &[
                ("X-Watch-Key", key.to_string()),
                ("X-Watch-Rev", revision.to_string()),
            ],
        )
        .await?;

        let (tx, rx) = mpsc::channel(100);
        tokio::spawn(async move {
            let mut lines = conn.lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => return,
                    Err(err) => {
                        let _ = tx.send(WatchEvent::error(err.to_string())).await;
                        return;
                    }
                };
                let event = match serde_json::from_str::<WatchEvent>(&line) {
                    Ok(event) => event,
                    Err(err) => {
                        let _ = tx.send(WatchEvent::error(err.to_string())).await;
                        return;
                    }
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}
