//! Engine RPC client
//!
//! Connects to a peer's engine through its `/db` upgrade tunnel and speaks
//! the newline-JSON RPC.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

use crate::common::{Error, Result};
use crate::transport::{self, Cert, Conn};

use super::{EngineRequest, EngineResponse, NodeInfo, NodeRole, NodeStore};

pub struct EngineClient {
    conn: Conn,
    address: String,
}

impl EngineClient {
    /// Open an engine tunnel to the given peer.
    pub async fn connect(cert: &Cert, addr: &str) -> Result<Self> {
        let conn = transport::upgrade(cert, addr, "POST", "/db", "dqlite", &[]).await?;
        Ok(Self {
            conn,
            address: addr.to_string(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Address of the current leader, as far as the peer knows.
    pub async fn leader(&mut self) -> Result<Option<String>> {
        let response = self.call(&EngineRequest::Leader).await?;
        Ok(response.leader)
    }

    /// Snapshot of the cluster roster.
    pub async fn cluster(&mut self) -> Result<Vec<NodeInfo>> {
        let response = self.call(&EngineRequest::Cluster).await?;
        Ok(response.nodes.unwrap_or_default())
    }

    /// Ask the leader to add a member.
    pub async fn add(&mut self, node: NodeInfo) -> Result<()> {
        self.call(&EngineRequest::Add { node }).await.map(|_| ())
    }

    /// Ask the leader to change a member's role.
    pub async fn assign(&mut self, id: u64, role: NodeRole) -> Result<()> {
        self.call(&EngineRequest::Assign { id, role })
            .await
            .map(|_| ())
    }

    /// Ask the leader to hand leadership to another voter.
    pub async fn transfer(&mut self) -> Result<()> {
        self.call(&EngineRequest::Transfer).await.map(|_| ())
    }

    pub(super) async fn promote(&mut self, roster: Vec<NodeInfo>) -> Result<()> {
        self.call(&EngineRequest::Promote { roster })
            .await
            .map(|_| ())
    }

    async fn call(&mut self, request: &EngineRequest) -> Result<EngineResponse> {
        let mut data = serde_json::to_vec(request)?;
        data.push(b'\n');
        self.conn.write_all(&data).await?;
        self.conn.flush().await?;

        let mut line = String::new();
        if self.conn.read_line(&mut line).await? == 0 {
            return Err(Error::Transport("engine connection closed".into()));
        }
        let response: EngineResponse = serde_json::from_str(&line)?;
        if !response.ok {
            return Err(Error::Internal(
                response.error.unwrap_or_else(|| "engine error".into()),
            ));
        }
        Ok(response)
    }
}

/// Find the current cluster leader by probing the known peers.
///
/// Every peer is asked who it believes the leader is; self-reported leaders
/// win, hints are chased one hop. Fails with [`Error::LeaderUnknown`] when no
/// peer resolves.
pub async fn find_leader(cert: &Cert, store: &NodeStore) -> Result<EngineClient> {
    for peer in store.list()? {
        let Ok(mut client) = EngineClient::connect(cert, &peer.address).await else {
            continue;
        };
        let Ok(hint) = client.leader().await else {
            continue;
        };
        match hint {
            Some(addr) if addr == peer.address => return Ok(client),
            Some(addr) => {
                if let Ok(mut leader) = EngineClient::connect(cert, &addr).await {
                    if let Ok(Some(confirmed)) = leader.leader().await {
                        if confirmed == addr {
                            return Ok(leader);
                        }
                    }
                }
            }
            None => {}
        }
    }
    Err(Error::LeaderUnknown)
}
