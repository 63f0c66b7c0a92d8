//! Watch endpoint
//!
//! Two roles share `/watch`:
//! - POST with `Upgrade: watch`: a follower forwards mutation events from
//!   its local write path; each newline-JSON `KeyValue` is pushed into the
//!   leader's changes channel.
//! - GET with `Upgrade: watch`, `X-Watch-Key` and `X-Watch-Rev`: a client
//!   subscribes. The stream starts with `{"Start":true}`, backfills history
//!   from the requested revision, then carries matching live events.

use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;

use crate::common::Result;
use crate::store::KeyValue;
use crate::watch::{matches_key, WatchEvent};

use super::api::{upgrade_header, upgrade_response, ApiState};

pub(super) async fn handle(State(state): State<ApiState>, mut req: Request) -> Response {
    if upgrade_header(&req) != Some("watch") {
        return (
            StatusCode::BAD_REQUEST,
            "missing or invalid upgrade header",
        )
            .into_response();
    }

    // Receive change notifications forwarded by a follower.
    if req.method() == Method::POST {
        let on_upgrade = hyper::upgrade::on(&mut req);
        let changes = state.changes.clone();
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => ingest(upgraded, changes).await,
                Err(err) => tracing::debug!("watch ingest upgrade: {}", err),
            }
        });
        return upgrade_response("watch");
    }

    // Broadcast change notifications to a subscriber.
    if req.method() == Method::GET {
        let key = match req
            .headers()
            .get("x-watch-key")
            .and_then(|v| v.to_str().ok())
        {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => return (StatusCode::BAD_REQUEST, "missing key header").into_response(),
        };

        let revision = match req
            .headers()
            .get("x-watch-rev")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
        {
            Some(revision) => revision,
            None => return (StatusCode::BAD_REQUEST, "bad revision").into_response(),
        };

        let on_upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => subscriber(upgraded, state, key, revision).await,
                Err(err) => tracing::debug!("watch subscribe upgrade: {}", err),
            }
        });
        return upgrade_response("watch");
    }

    StatusCode::METHOD_NOT_ALLOWED.into_response()
}

/// Read forwarded events off the tunnel until the follower closes it.
async fn ingest(upgraded: Upgraded, changes: mpsc::Sender<KeyValue>) {
    let mut lines = BufReader::new(TokioIo::new(upgraded)).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            // EOF or broken tunnel: the follower reconnects on next write.
            Ok(None) | Err(_) => return,
        };
        let kv: KeyValue = match serde_json::from_str(&line) {
            Ok(kv) => kv,
            Err(err) => {
                tracing::debug!("bad change frame: {}", err);
                return;
            }
        };
        // A full channel blocks here, back-pressuring the follower.
        if changes.send(kv).await.is_err() {
            return;
        }
    }
}

/// Serve one subscription: handshake marker, replay, then live events.
async fn subscriber(upgraded: Upgraded, state: ApiState, key: String, revision: i64) {
    let mut events = state.broadcaster.subscribe();
    let mut writer = BufWriter::new(TokioIo::new(upgraded));

    if send_event(&mut writer, &WatchEvent::start()).await.is_err() {
        return;
    }

    if revision > 0 {
        let history = match state.db.replay(&key, revision) {
            Ok(history) => history,
            Err(err) => {
                let _ = send_event(&mut writer, &WatchEvent::error(err.to_string())).await;
                return;
            }
        };
        for kv in history {
            if send_event(&mut writer, &WatchEvent::kv(kv)).await.is_err() {
                return;
            }
        }
    }

    loop {
        let kv = tokio::select! {
            _ = state.cancel.cancelled() => return,
            kv = events.recv() => match kv {
                Some(kv) => kv,
                None => return,
            },
        };
        if matches_key(&key, &kv.key) {
            if send_event(&mut writer, &WatchEvent::kv(kv)).await.is_err() {
                return;
            }
        }
    }
}

/// One JSON object per event, newline-terminated, flushed immediately.
async fn send_event<W: AsyncWrite + Unpin>(writer: &mut W, event: &WatchEvent) -> Result<()> {
    let mut data = serde_json::to_vec(event)?;
    data.push(b'\n');
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}
