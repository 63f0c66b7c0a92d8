//! Node supervisor
//!
//! Assembles the pieces of one cluster node: configuration, the engine
//! wrapper, the revisioned KV database, the membership controller, the
//! change broadcaster and the HTTP API. Runs the background maintenance
//! loops and owns shutdown ordering.

pub mod api;
pub mod config;
mod watch;

pub use api::ApiState;
pub use config::{Config, Init};

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::cluster::Membership;
use crate::common::Result;
use crate::engine::{self, EngineNode, NodeInfo, NodeRole, NodeStore};
use crate::store::{Db, KeyValue};
use crate::transport::{self, Cert};
use crate::watch::Broadcaster;

/// Capacity of the changes channel feeding the broadcaster. Overflow blocks
/// producers, back-pressuring follower-originated writes.
const CHANGES_BUFFER: usize = 1024;

const ROSTER_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
const ADJUST_INTERVAL: Duration = Duration::from_secs(30);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// One running cluster node.
pub struct Server {
    dir: PathBuf,
    id: u64,
    address: String,
    cert: Arc<Cert>,
    db: Arc<Db>,
    membership: Arc<Membership>,
    changes: mpsc::Sender<KeyValue>,
    /// Cancels the background maintenance loops.
    loops_cancel: CancellationToken,
    /// Cancels the network surface: HTTP server, engine socket, broadcaster.
    cancel: CancellationToken,
    http_task: Mutex<Option<JoinHandle<()>>>,
    engine_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Start a node from the given directory.
    pub async fn new(dir: impl AsRef<Path>) -> Result<Server> {
        let dir = dir.as_ref().to_path_buf();
        let mut cfg = Config::load(&dir)?;

        let db = Arc::new(Db::open(dir.join("kv.db"))?);

        // Possibly initialize our id, address and initial roster.
        let bootstrap = match &cfg.init {
            Some(init) if init.cluster.is_empty() => {
                cfg.id = engine::BOOTSTRAP_ID;
                cfg.address = init.address.clone();
                cfg.store.set(&[NodeInfo {
                    id: cfg.id,
                    address: cfg.address.clone(),
                    role: NodeRole::Voter,
                }])?;
                true
            }
            Some(init) => {
                cfg.id = engine::derive_node_id(&init.address);
                cfg.address = init.address.clone();
                let seeds: Vec<NodeInfo> = init
                    .cluster
                    .iter()
                    .map(|address| NodeInfo {
                        id: 0,
                        address: address.clone(),
                        role: NodeRole::Spare,
                    })
                    .collect();
                cfg.store.set(&seeds)?;
                false
            }
            None => false,
        };
        if cfg.init.is_some() {
            cfg.save(&dir)?;
        }

        tracing::info!("Starting node {}", cfg.address);
        tracing::info!("  Data dir: {}", dir.display());
        tracing::info!("  Node id: {:#x}", cfg.id);

        let cancel = CancellationToken::new();
        let loops_cancel = CancellationToken::new();

        // The local engine node, reachable through the /db tunnel.
        let engine = EngineNode::new(&cfg.address, dir.join("engine.sock"), cfg.cert.clone());
        let engine_task = engine.start(cancel.child_token())?;
        if bootstrap {
            engine.bootstrap(cfg.id);
        } else if cfg.init.is_none() {
            engine.restore(cfg.store.list()?);
        }

        let (changes_tx, changes_rx) = mpsc::channel(CHANGES_BUFFER);
        let broadcaster = Arc::new(Broadcaster::new(changes_rx, cancel.child_token()));

        let membership = Arc::new(Membership::new(
            &cfg.address,
            cfg.store.clone(),
            cfg.cert.clone(),
        ));

        let state = ApiState {
            db: db.clone(),
            membership: membership.clone(),
            changes: changes_tx.clone(),
            broadcaster,
            engine_socket: engine.socket_path().clone(),
            cancel: cancel.child_token(),
        };
        let router = api::router(state);

        let (listener, acceptor) = transport::listen(&cfg.address, &cfg.cert).await?;
        let http_task = tokio::spawn(serve(listener, acceptor, router, cancel.child_token()));

        // A bootstrap node creates the schema; a joiner registers with the
        // leader and receives its state through replication.
        if cfg.init.is_some() {
            if bootstrap {
                db.create_schema()?;
            } else {
                membership.add(cfg.id, &cfg.address).await?;
            }
        }

        start_updater(
            db.clone(),
            cfg.store.clone(),
            membership.clone(),
            engine.clone(),
            loops_cancel.clone(),
        );

        tracing::info!("✓ Node ready on {}", cfg.address);

        Ok(Server {
            dir,
            id: cfg.id,
            address: cfg.address,
            cert: cfg.cert,
            db,
            membership,
            changes: changes_tx,
            loops_cancel,
            cancel,
            http_task: Mutex::new(Some(http_task)),
            engine_task: Mutex::new(Some(engine_task)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn cert(&self) -> Arc<Cert> {
        self.cert.clone()
    }

    pub fn db(&self) -> Arc<Db> {
        self.db.clone()
    }

    pub fn membership(&self) -> Arc<Membership> {
        self.membership.clone()
    }

    pub(crate) fn changes(&self) -> mpsc::Sender<KeyValue> {
        self.changes.clone()
    }

    /// Push a local mutation event into the broadcaster's source channel.
    pub async fn notify(&self, kv: KeyValue) -> Result<()> {
        self.changes
            .send(kv)
            .await
            .map_err(|_| crate::Error::Internal("changes channel closed".into()))
    }

    /// Shut the node down: stop the maintenance loops, close the database,
    /// hand off membership duties, then tear down the network surface. Both
    /// listeners are released by the time this returns.
    pub async fn close(&self) -> Result<()> {
        self.loops_cancel.cancel();
        self.db.close()?;
        self.membership.shutdown().await;
        self.cancel.cancel();

        let http_task = self.http_task.lock().expect("task handle mutex poisoned").take();
        if let Some(task) = http_task {
            let _ = task.await;
        }
        let engine_task = self
            .engine_task
            .lock()
            .expect("task handle mutex poisoned")
            .take();
        if let Some(task) = engine_task {
            let _ = task.await;
        }

        tracing::info!("Node {} stopped", self.address);
        Ok(())
    }
}

/// Accept TLS connections and serve HTTP/1.1 with upgrade support.
async fn serve(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    cancel: CancellationToken,
) {
    loop {
        let (stream, _) = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => panic!("API listener failed: {}", err),
            },
        };

        let acceptor = acceptor.clone();
        let router = router.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(err) => {
                    tracing::debug!("TLS handshake: {}", err);
                    return;
                }
            };

            let service = TowerToHyperService::new(router);
            let conn = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(tls), service)
                .with_upgrades();
            tokio::pin!(conn);

            tokio::select! {
                _ = cancel.cancelled() => {},
                result = conn.as_mut() => {
                    if let Err(err) = result {
                        tracing::debug!("API connection: {}", err);
                    }
                }
            }
        });
    }
}

/// The three periodic maintenance loops: roster refresh, role adjustment
/// and TTL/history cleanup. Failures are logged and retried next round.
fn start_updater(
    db: Arc<Db>,
    store: Arc<NodeStore>,
    membership: Arc<Membership>,
    engine: Arc<EngineNode>,
    cancel: CancellationToken,
) {
    {
        let membership = membership.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(ROSTER_REFRESH_INTERVAL) => {}
                }
                match membership.list().await {
                    Ok(servers) => {
                        if let Err(err) = store.set(&servers) {
                            tracing::warn!("update peer store: {}", err);
                        }
                        engine.set_roster(servers);
                        if let Ok(Some(address)) = membership.leader().await {
                            engine.set_leader_hint(address);
                        }
                    }
                    Err(err) => tracing::warn!("refresh cluster roster: {}", err),
                }
            }
        });
    }

    {
        let membership = membership.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(ADJUST_INTERVAL) => {}
                }
                membership.adjust().await;
            }
        });
    }

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(CLEANUP_INTERVAL) => {}
            }
            if let Err(err) = db.cleanup() {
                tracing::warn!("purge expired entries: {}", err);
            }
        }
    });
}
