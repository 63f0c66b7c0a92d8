//! Cluster HTTP API
//!
//! Three endpoints, all behind mutual TLS:
//! - `GET /cluster`: JSON roster of the cluster members
//! - `/watch`: upgrade tunnel for change subscription and forwarding
//! - `/db`: upgrade tunnel proxied to the local engine socket

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cluster::Membership;
use crate::store::{Db, KeyValue};
use crate::transport;
use crate::watch::Broadcaster;

use super::watch;

/// Shared state for the API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<Db>,
    pub membership: Arc<Membership>,
    pub changes: mpsc::Sender<KeyValue>,
    pub broadcaster: Arc<Broadcaster>,
    pub engine_socket: PathBuf,
    pub cancel: CancellationToken,
}

/// Creates the HTTP router with all cluster endpoints.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/cluster", get(cluster))
        .route("/watch", any(watch::handle))
        .route("/db", any(db_tunnel))
        .with_state(state)
}

/// The upgrade token carried by the request, if any.
pub(super) fn upgrade_header(req: &Request) -> Option<&str> {
    req.headers().get(header::UPGRADE)?.to_str().ok()
}

/// The fixed 101 handshake switching the connection to a raw tunnel.
pub(super) fn upgrade_response(protocol: &'static str) -> Response {
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, protocol)
        .header(header::CONNECTION, "upgrade")
        .body(Body::empty())
        .expect("build upgrade response")
}

/// GET /cluster: the roster as seen by the leader.
async fn cluster(State(state): State<ApiState>) -> Response {
    match state.membership.list().await {
        Ok(servers) => Json(servers).into_response(),
        Err(err) => (err.to_http_status(), format!("can't list servers: {}", err)).into_response(),
    }
}

/// /db: hijack the connection and proxy bytes to the engine's unix socket.
async fn db_tunnel(State(state): State<ApiState>, mut req: Request) -> Response {
    if upgrade_header(&req) != Some("dqlite") {
        return (
            StatusCode::BAD_REQUEST,
            "missing or invalid upgrade header",
        )
            .into_response();
    }

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                tracing::debug!("db tunnel upgrade: {}", err);
                return;
            }
        };

        let unix = match UnixStream::connect(&state.engine_socket).await {
            Ok(unix) => unix,
            Err(_) => panic!("engine is not listening on its unix socket"),
        };

        transport::proxy(TokioIo::new(upgraded), unix).await;
    });

    upgrade_response("dqlite")
}
