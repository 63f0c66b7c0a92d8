//! Persisted peer roster
//!
//! The addresses of the known cluster members live in a small SQLite
//! database (`servers.sql`) inside the node directory, so a restarted node
//! can find its peers again without an init file.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

use crate::common::{Error, Result};

use super::{NodeInfo, NodeRole};

/// Store holding the last known cluster roster.
pub struct NodeStore {
    conn: Mutex<Connection>,
}

impl NodeStore {
    /// Open (or create) the roster database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS servers (
                id INTEGER NOT NULL,
                address TEXT NOT NULL UNIQUE,
                role TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// The known peers, ordered by address.
    pub fn list(&self) -> Result<Vec<NodeInfo>> {
        let conn = self.conn.lock().expect("node store mutex poisoned");
        let mut stmt =
            conn.prepare_cached("SELECT id, address, role FROM servers ORDER BY address ASC")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut nodes = Vec::with_capacity(rows.len());
        for (id, address, role) in rows {
            nodes.push(NodeInfo {
                id: id as u64,
                address,
                role: parse_role(&role)?,
            });
        }
        Ok(nodes)
    }

    /// Replace the stored roster.
    pub fn set(&self, nodes: &[NodeInfo]) -> Result<()> {
        let mut conn = self.conn.lock().expect("node store mutex poisoned");
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM servers", [])?;
        for node in nodes {
            tx.execute(
                "INSERT INTO servers(id, address, role) VALUES (?, ?, ?)",
                rusqlite::params![node.id as i64, node.address, node.role.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn parse_role(role: &str) -> Result<NodeRole> {
    match role {
        "voter" => Ok(NodeRole::Voter),
        "spare" => Ok(NodeRole::Spare),
        other => Err(Error::InvalidConfig(format!("unknown role {:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_roundtrip() {
        let dir = tempdir().unwrap();
        let store = NodeStore::open(dir.path().join("servers.sql")).unwrap();

        assert!(store.list().unwrap().is_empty());

        let nodes = vec![
            NodeInfo {
                id: 1,
                address: "localhost:9991".into(),
                role: NodeRole::Voter,
            },
            NodeInfo {
                id: 2,
                address: "localhost:9992".into(),
                role: NodeRole::Spare,
            },
        ];
        store.set(&nodes).unwrap();
        assert_eq!(store.list().unwrap(), nodes);

        // Replacing drops stale entries.
        store.set(&nodes[1..]).unwrap();
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].address, "localhost:9992");
    }
}
