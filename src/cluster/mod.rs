//! Cluster membership controller
//!
//! Keeps the voter set near the target size and handles graceful handover:
//! - 1 peer: nothing to do
//! - 2 peers: the non-leader is demoted to spare
//! - fewer than 3 voters: spares are promoted until 3 voters exist
//! - more than 3 voters: one non-leader voter is demoted
//!
//! Role changes are one RPC each and stop at the first success; the
//! periodic adjust loop supplies the retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::common::Result;
use crate::engine::{self, EngineClient, NodeInfo, NodeRole, NodeStore};
use crate::transport::Cert;

const FIND_LEADER_TIMEOUT: Duration = Duration::from_secs(5);
const RPC_TIMEOUT: Duration = Duration::from_secs(5);
const BACKGROUND_TIMEOUT: Duration = Duration::from_secs(30);

/// Target number of voters in a big-enough cluster.
const TARGET_VOTERS: usize = 3;

/// Manages cluster membership through the current leader.
pub struct Membership {
    address: String,
    store: Arc<NodeStore>,
    cert: Arc<Cert>,
}

impl Membership {
    pub fn new(address: &str, store: Arc<NodeStore>, cert: Arc<Cert>) -> Self {
        Self {
            address: address.to_string(),
            store,
            cert,
        }
    }

    /// Snapshot of the cluster roster, via the leader.
    pub async fn list(&self) -> Result<Vec<NodeInfo>> {
        let mut leader = self.get_leader().await?;
        Ok(timeout(RPC_TIMEOUT, leader.cluster()).await??)
    }

    /// Ask the leader to add a spare member.
    pub async fn add(&self, id: u64, address: &str) -> Result<()> {
        let mut leader = self.get_leader().await?;
        let node = NodeInfo {
            id,
            address: address.to_string(),
            role: NodeRole::Spare,
        };
        Ok(timeout(RPC_TIMEOUT, leader.add(node)).await??)
    }

    /// Address of the current leader, if any.
    pub async fn leader(&self) -> Result<Option<String>> {
        let mut leader = self.get_leader().await?;
        Ok(timeout(RPC_TIMEOUT, leader.leader()).await??)
    }

    /// Rebalance replication roles. Only acts when called on the leader;
    /// failures are logged, the periodic loop retries.
    pub async fn adjust(&self) {
        if let Err(err) = self.try_adjust().await {
            tracing::warn!("adjust cluster roles: {}", err);
        }
    }

    async fn try_adjust(&self) -> Result<()> {
        let mut leader = self.get_leader().await?;

        let info = timeout(BACKGROUND_TIMEOUT, leader.leader()).await??;
        if info.as_deref() != Some(self.address.as_str()) {
            return Ok(());
        }

        let servers = timeout(BACKGROUND_TIMEOUT, leader.cluster()).await??;
        for (id, role) in plan_adjustment(&servers, &self.address) {
            if matches!(
                timeout(BACKGROUND_TIMEOUT, leader.assign(id, role)).await,
                Ok(Ok(()))
            ) {
                break;
            }
        }

        Ok(())
    }

    /// Best effort to shut down gracefully: hand our voter slot to a spare
    /// and, if we lead, transfer leadership away.
    pub async fn shutdown(&self) {
        if let Err(err) = self.try_shutdown().await {
            tracing::warn!("graceful membership shutdown: {}", err);
        }
    }

    async fn try_shutdown(&self) -> Result<()> {
        let mut leader = self.get_leader().await?;

        let servers = timeout(BACKGROUND_TIMEOUT, leader.cluster()).await??;
        let me = match servers.iter().find(|s| s.address == self.address) {
            Some(me) if me.role == NodeRole::Voter => me.clone(),
            _ => return Ok(()), // not a voter, nothing to hand over
        };

        for server in &servers {
            if server.role == NodeRole::Voter || server.address == self.address {
                continue;
            }
            if matches!(
                timeout(BACKGROUND_TIMEOUT, leader.assign(server.id, NodeRole::Voter)).await,
                Ok(Ok(()))
            ) {
                let _ = timeout(BACKGROUND_TIMEOUT, leader.assign(me.id, NodeRole::Spare)).await;
                break;
            }
        }

        let info = timeout(BACKGROUND_TIMEOUT, leader.leader()).await??;
        if info.as_deref() == Some(self.address.as_str()) {
            let _ = timeout(BACKGROUND_TIMEOUT, leader.transfer()).await;
        }

        Ok(())
    }

    async fn get_leader(&self) -> Result<EngineClient> {
        timeout(
            FIND_LEADER_TIMEOUT,
            engine::find_leader(&self.cert, &self.store),
        )
        .await?
    }
}

/// Role changes that would move the roster toward the target voter count,
/// in preference order. The caller applies the first that succeeds.
fn plan_adjustment(servers: &[NodeInfo], leader: &str) -> Vec<(u64, NodeRole)> {
    if servers.len() <= 1 {
        return Vec::new();
    }

    // With two servers the second one is kept as a spare.
    if servers.len() == 2 {
        return servers
            .iter()
            .filter(|s| s.address != leader && s.role == NodeRole::Voter)
            .map(|s| (s.id, NodeRole::Spare))
            .collect();
    }

    let voters: Vec<&NodeInfo> = servers.iter().filter(|s| s.role == NodeRole::Voter).collect();
    let spares: Vec<&NodeInfo> = servers.iter().filter(|s| s.role == NodeRole::Spare).collect();

    if voters.len() < TARGET_VOTERS {
        spares.iter().map(|s| (s.id, NodeRole::Voter)).collect()
    } else if voters.len() > TARGET_VOTERS {
        voters
            .iter()
            .filter(|s| s.address != leader)
            .map(|s| (s.id, NodeRole::Spare))
            .collect()
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u64, address: &str, role: NodeRole) -> NodeInfo {
        NodeInfo {
            id,
            address: address.to_string(),
            role,
        }
    }

    #[test]
    fn test_single_node_is_stable() {
        let servers = vec![node(1, "a:1", NodeRole::Voter)];
        assert!(plan_adjustment(&servers, "a:1").is_empty());
    }

    #[test]
    fn test_two_nodes_demote_follower() {
        let servers = vec![
            node(1, "a:1", NodeRole::Voter),
            node(2, "b:1", NodeRole::Voter),
        ];
        assert_eq!(plan_adjustment(&servers, "a:1"), vec![(2, NodeRole::Spare)]);
    }

    #[test]
    fn test_two_nodes_follower_already_spare() {
        let servers = vec![
            node(1, "a:1", NodeRole::Voter),
            node(2, "b:1", NodeRole::Spare),
        ];
        assert!(plan_adjustment(&servers, "a:1").is_empty());
    }

    #[test]
    fn test_promote_spares_up_to_three_voters() {
        let servers = vec![
            node(1, "a:1", NodeRole::Voter),
            node(2, "b:1", NodeRole::Spare),
            node(3, "c:1", NodeRole::Spare),
            node(4, "d:1", NodeRole::Spare),
        ];
        let plan = plan_adjustment(&servers, "a:1");
        assert_eq!(plan.len(), 3);
        assert!(plan.iter().all(|(_, role)| *role == NodeRole::Voter));
    }

    #[test]
    fn test_demote_excess_voter_but_never_leader() {
        let servers = vec![
            node(1, "a:1", NodeRole::Voter),
            node(2, "b:1", NodeRole::Voter),
            node(3, "c:1", NodeRole::Voter),
            node(4, "d:1", NodeRole::Voter),
        ];
        let plan = plan_adjustment(&servers, "a:1");
        assert!(!plan.is_empty());
        assert!(plan.iter().all(|(id, _)| *id != 1));
        assert!(plan.iter().all(|(_, role)| *role == NodeRole::Spare));
    }

    #[test]
    fn test_three_voters_is_stable() {
        let servers = vec![
            node(1, "a:1", NodeRole::Voter),
            node(2, "b:1", NodeRole::Voter),
            node(3, "c:1", NodeRole::Voter),
            node(4, "d:1", NodeRole::Spare),
        ];
        assert!(plan_adjustment(&servers, "a:1").is_empty());
    }
}
