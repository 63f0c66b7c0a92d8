//! Change notification publishing
//!
//! Every committed mutation is announced to the cluster leader, whose
//! broadcaster fans it out to watchers. When the local node is the leader
//! the event goes straight onto the changes channel; otherwise it is
//! forwarded over a cached `/watch` POST tunnel. A tunnel that fails a
//! write is evicted and reopened on the next publish.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};

use crate::cluster::Membership;
use crate::common::{Error, Result};
use crate::server::Server;
use crate::store::KeyValue;
use crate::transport::{self, Cert, Conn};

pub struct Notifier {
    address: String,
    cert: Arc<Cert>,
    membership: Arc<Membership>,
    changes: mpsc::Sender<KeyValue>,
    /// One cached forwarding connection per leader address.
    conns: Mutex<HashMap<String, Conn>>,
}

impl Notifier {
    pub fn new(server: &Server) -> Self {
        Self {
            address: server.address().to_string(),
            cert: server.cert(),
            membership: server.membership(),
            changes: server.changes(),
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// Announce a committed mutation to the leader.
    pub async fn publish(&self, kv: &KeyValue) -> Result<()> {
        let leader = self
            .membership
            .leader()
            .await?
            .ok_or(Error::LeaderUnknown)?;

        // Shortcut if we are the leader.
        if leader == self.address {
            return self
                .changes
                .send(kv.clone())
                .await
                .map_err(|_| Error::Internal("changes channel closed".into()));
        }

        let mut conns = self.conns.lock().await;
        if !conns.contains_key(&leader) {
            let conn =
                transport::upgrade(&self.cert, &leader, "POST", "/watch", "watch", &[]).await?;
            conns.insert(leader.clone(), conn);
        }
        let conn = conns.get_mut(&leader).expect("connection just inserted");

        let mut data = serde_json::to_vec(kv)?;
        data.push(b'\n');

        let written = async {
            conn.write_all(&data).await?;
            conn.flush().await
        }
        .await;
        if let Err(err) = written {
            // Evict the broken tunnel; the next publish reopens it.
            conns.remove(&leader);
            return Err(err.into());
        }

        Ok(())
    }
}
