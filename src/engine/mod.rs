//! Replicated engine wrapper (simplified)
//!
//! The storage backend is designed around an external replicated SQL engine
//! that owns consensus, data replication and leader election. This module is
//! a minimal in-process stand-in exposing the surface the rest of the node
//! consumes: a `Leader()` oracle, a `Cluster()` roster, role assignment and
//! leadership transfer, all reachable through the `/db` upgrade tunnel.
//!
//! Leadership is deliberately simple: the bootstrap node starts out as
//! leader and leadership moves only by explicit transfer. For production,
//! plug in a full consensus engine behind the same RPC surface.

pub mod client;
pub mod node;
pub mod store;

pub use client::{find_leader, EngineClient};
pub use node::EngineNode;
pub use store::NodeStore;

use serde::{Deserialize, Serialize};

/// Well-known id of the node that bootstraps a fresh cluster.
pub const BOOTSTRAP_ID: u64 = 0x2dc1_7185_8c31_55be;

/// Replication role of a cluster member.
///
/// Only voters participate in the quorum; spares are standbys that the
/// membership controller promotes as needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Voter,
    Spare,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Voter => write!(f, "voter"),
            NodeRole::Spare => write!(f, "spare"),
        }
    }
}

/// One entry of the cluster roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: u64,
    pub address: String,
    pub role: NodeRole,
}

/// Derive a deterministic node id from the node's own address.
pub fn derive_node_id(address: &str) -> u64 {
    let digest = blake3::hash(address.as_bytes());
    u64::from_be_bytes(digest.as_bytes()[..8].try_into().expect("digest too short"))
}

/// Engine RPC request, one JSON object per line over the `/db` tunnel.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EngineRequest {
    /// Who is the current leader, as far as this node knows?
    Leader,
    /// Snapshot of the roster.
    Cluster,
    /// Add a new member (leader only).
    Add { node: NodeInfo },
    /// Change a member's role (leader only).
    Assign { id: u64, role: NodeRole },
    /// Hand leadership to another voter (leader only).
    Transfer,
    /// Accept leadership and the authoritative roster.
    Promote { roster: Vec<NodeInfo> },
}

/// Engine RPC response.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EngineResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<NodeInfo>>,
}

impl EngineResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_node_id_deterministic() {
        let a = derive_node_id("localhost:9991");
        let b = derive_node_id("localhost:9991");
        let c = derive_node_id("localhost:9992");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, BOOTSTRAP_ID);
    }
}
