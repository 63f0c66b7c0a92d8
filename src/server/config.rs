//! On-disk node configuration
//!
//! A node directory holds the cluster keypair (`cluster.crt`/`cluster.key`),
//! the persisted peer roster (`servers.sql`) and the node identity
//! (`info.yaml`). A fresh node instead carries an `init.yaml` describing how
//! to seed itself; it is consumed and replaced by `info.yaml` once
//! initialization completes.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::common::{Error, Result};
use crate::engine::NodeStore;
use crate::transport::{self, Cert};

/// Initialization parameters, for new nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Init {
    /// Network address this node will serve on.
    pub address: String,
    /// Addresses of existing cluster members; empty for a bootstrap node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster: Vec<String>,
}

/// Node identity, written after initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Info {
    id: u64,
    address: String,
}

/// Server configuration loaded from the node directory.
pub struct Config {
    pub cert: Arc<Cert>,
    pub init: Option<Init>,
    pub store: Arc<NodeStore>,
    pub id: u64,
    pub address: String,
}

impl Config {
    /// Load the configuration from disk.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();

        let cert = Arc::new(transport::load_cert(dir)?);
        let init = load_init(dir)?;
        let store = Arc::new(NodeStore::open(dir.join("servers.sql"))?);

        let (id, address) = match init {
            Some(_) => (0, String::new()),
            None => load_info(dir)?,
        };

        Ok(Self {
            cert,
            init,
            store,
            id,
            address,
        })
    }

    /// Persist the node identity and drop the init file.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();

        let info = Info {
            id: self.id,
            address: self.address.clone(),
        };
        let data = serde_yaml::to_string(&info)?;
        std::fs::write(dir.join("info.yaml"), data)?;

        std::fs::remove_file(dir.join("init.yaml"))?;
        Ok(())
    }
}

fn load_init(dir: &Path) -> Result<Option<Init>> {
    let path = dir.join("init.yaml");
    let data = match std::fs::read_to_string(&path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let init: Init = serde_yaml::from_str(&data)?;
    if init.address.is_empty() {
        return Err(Error::InvalidConfig("init address is empty".into()));
    }
    Ok(Some(init))
}

fn load_info(dir: &Path) -> Result<(u64, String)> {
    let data = std::fs::read_to_string(dir.join("info.yaml"))?;
    let info: Info = serde_yaml::from_str(&data)?;

    if info.id == 0 {
        return Err(Error::InvalidConfig("node id is zero".into()));
    }
    if info.address.is_empty() {
        return Err(Error::InvalidConfig("node address is empty".into()));
    }

    Ok((info.id, info.address))
}
