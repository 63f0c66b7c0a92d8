//! Per-node engine state and RPC endpoint
//!
//! Listens on a unix socket inside the node directory; the `/db` HTTP
//! endpoint proxies remote peers onto it. Requests are newline-delimited
//! JSON, one request and one response per line.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::common::Result;
use crate::transport::Cert;

use super::{EngineClient, EngineRequest, EngineResponse, NodeInfo, NodeRole};

struct EngineState {
    roster: Vec<NodeInfo>,
    is_leader: bool,
    /// Last known leader address; kept current by the roster refresh loop
    /// and by leadership handovers.
    leader_hint: Option<String>,
}

/// The local engine node.
pub struct EngineNode {
    address: String,
    socket_path: PathBuf,
    cert: Arc<Cert>,
    state: Arc<Mutex<EngineState>>,
}

impl EngineNode {
    pub fn new(address: &str, socket_path: PathBuf, cert: Arc<Cert>) -> Arc<Self> {
        Arc::new(Self {
            address: address.to_string(),
            socket_path,
            cert,
            state: Arc::new(Mutex::new(EngineState {
                roster: Vec::new(),
                is_leader: false,
                leader_hint: None,
            })),
        })
    }

    /// Seed this node as the first member of a fresh cluster.
    pub fn bootstrap(&self, id: u64) {
        let mut state = self.state.lock().expect("engine state mutex poisoned");
        state.roster = vec![NodeInfo {
            id,
            address: self.address.clone(),
            role: NodeRole::Voter,
        }];
        state.is_leader = true;
        state.leader_hint = Some(self.address.clone());
    }

    /// Restore engine state from the persisted roster after a restart.
    ///
    /// The first voter in roster order takes leadership again; everyone
    /// else points their hint at it. A real consensus engine would recover
    /// this from its own log.
    pub fn restore(&self, roster: Vec<NodeInfo>) {
        let mut state = self.state.lock().expect("engine state mutex poisoned");
        let leader = roster
            .iter()
            .find(|n| n.role == NodeRole::Voter)
            .map(|n| n.address.clone());
        state.is_leader = leader.as_deref() == Some(self.address.as_str());
        state.leader_hint = leader;
        state.roster = roster;
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().expect("engine state mutex poisoned").is_leader
    }

    /// Replace the local roster copy with the leader's view.
    pub fn set_roster(&self, roster: Vec<NodeInfo>) {
        let mut state = self.state.lock().expect("engine state mutex poisoned");
        if !state.is_leader {
            state.roster = roster;
        }
    }

    /// Record where the leader currently is.
    pub fn set_leader_hint(&self, address: String) {
        let mut state = self.state.lock().expect("engine state mutex poisoned");
        if !state.is_leader {
            state.leader_hint = Some(address);
        }
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Bind the unix socket and serve engine RPCs until cancelled.
    ///
    /// The returned handle completes once the accept loop has stopped and
    /// the listener is released.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        // A previous run may have left a stale socket file behind.
        let _ = std::fs::remove_file(&self.socket_path);
        let listener = UnixListener::bind(&self.socket_path)?;

        let node = self.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else {
                            tracing::warn!("engine socket accept failed");
                            break;
                        };
                        let node = node.clone();
                        tokio::spawn(async move {
                            if let Err(err) = node.handle_conn(stream).await {
                                tracing::debug!("engine connection: {}", err);
                            }
                        });
                    }
                }
            }
        });

        Ok(task)
    }

    async fn handle_conn(&self, stream: UnixStream) -> Result<()> {
        let mut conn = BufReader::new(stream);
        let mut line = String::new();
        loop {
            line.clear();
            if conn.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            let response = match serde_json::from_str::<EngineRequest>(&line) {
                Ok(request) => self.handle_request(request).await,
                Err(err) => EngineResponse::error(format!("bad request: {}", err)),
            };
            let mut data = serde_json::to_vec(&response)?;
            data.push(b'\n');
            conn.write_all(&data).await?;
            conn.flush().await?;
        }
    }

    async fn handle_request(&self, request: EngineRequest) -> EngineResponse {
        match request {
            EngineRequest::Leader => {
                let state = self.state.lock().expect("engine state mutex poisoned");
                let leader = if state.is_leader {
                    Some(self.address.clone())
                } else {
                    state.leader_hint.clone()
                };
                EngineResponse {
                    ok: true,
                    leader,
                    ..Default::default()
                }
            }
            EngineRequest::Cluster => {
                let state = self.state.lock().expect("engine state mutex poisoned");
                EngineResponse {
                    ok: true,
                    nodes: Some(state.roster.clone()),
                    ..Default::default()
                }
            }
            EngineRequest::Add { node } => {
                let mut state = self.state.lock().expect("engine state mutex poisoned");
                if !state.is_leader {
                    return EngineResponse::error("not leader");
                }
                // Re-adding the same address updates the entry in place.
                state.roster.retain(|n| n.address != node.address);
                state.roster.push(node);
                EngineResponse::ok()
            }
            EngineRequest::Assign { id, role } => {
                let mut state = self.state.lock().expect("engine state mutex poisoned");
                if !state.is_leader {
                    return EngineResponse::error("not leader");
                }
                match state.roster.iter_mut().find(|n| n.id == id) {
                    Some(node) => {
                        node.role = role;
                        EngineResponse::ok()
                    }
                    None => EngineResponse::error(format!("no such node: {}", id)),
                }
            }
            EngineRequest::Transfer => self.transfer().await,
            EngineRequest::Promote { roster } => {
                let mut state = self.state.lock().expect("engine state mutex poisoned");
                state.roster = roster;
                state.is_leader = true;
                state.leader_hint = Some(self.address.clone());
                EngineResponse::ok()
            }
        }
    }

    /// Hand leadership to another voter, shipping the authoritative roster.
    async fn transfer(&self) -> EngineResponse {
        let (roster, target) = {
            let state = self.state.lock().expect("engine state mutex poisoned");
            if !state.is_leader {
                return EngineResponse::error("not leader");
            }
            let target = state
                .roster
                .iter()
                .find(|n| n.role == NodeRole::Voter && n.address != self.address)
                .cloned();
            (state.roster.clone(), target)
        };

        let Some(target) = target else {
            return EngineResponse::error("no voter to transfer leadership to");
        };

        let result = async {
            let mut client = EngineClient::connect(&self.cert, &target.address).await?;
            client.promote(roster).await
        }
        .await;

        match result {
            Ok(()) => {
                let mut state = self.state.lock().expect("engine state mutex poisoned");
                state.is_leader = false;
                state.leader_hint = Some(target.address);
                EngineResponse::ok()
            }
            Err(err) => EngineResponse::error(format!("transfer: {}", err)),
        }
    }
}
