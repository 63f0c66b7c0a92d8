//! High-level KV surface
//!
//! Wraps one running node behind a process-wide handle: the replicated
//! engine registers global state, so at most one node runs per process.
//! Reopening returns the existing handle; [`shutdown`] tears it down and
//! clears the slot. Put and delete on the same key are serialised by a
//! per-key advisory lock to limit optimistic-concurrency churn.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use once_cell::sync::Lazy;
use tokio::sync::{mpsc, Mutex};

use crate::client::{Client, Notifier};
use crate::common::{validate_key, Error, Result};
use crate::server::Server;
use crate::store::KeyValue;
use crate::watch::WatchEvent;

static NODE: Lazy<Mutex<Option<Arc<Kv>>>> = Lazy::new(|| Mutex::new(None));

/// Outcome of a create/put: the new revision plus the replaced version.
#[derive(Debug, Clone)]
pub struct PutResponse {
    pub revision: i64,
    pub prev_kv: Option<KeyValue>,
}

/// Outcome of a delete: the tombstone revision plus the deleted version.
#[derive(Debug, Clone)]
pub struct DeleteResponse {
    pub revision: i64,
    pub prev_kv: Option<KeyValue>,
}

/// The process-wide KV handle.
pub struct Kv {
    server: Server,
    notifier: Notifier,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Open the node in the given directory, starting it on first use. A node
/// that is already running is returned as-is, whatever directory it came
/// from.
pub async fn open(dir: impl AsRef<Path>) -> Result<Arc<Kv>> {
    let mut node = NODE.lock().await;
    if let Some(kv) = node.as_ref() {
        return Ok(kv.clone());
    }

    let server = Server::new(dir).await?;
    let notifier = Notifier::new(&server);
    let kv = Arc::new(Kv {
        server,
        notifier,
        locks: StdMutex::new(HashMap::new()),
    });
    *node = Some(kv.clone());
    Ok(kv)
}

/// Shut down the process-wide node, if it was started.
pub async fn shutdown() -> Result<()> {
    let mut node = NODE.lock().await;
    if let Some(kv) = node.take() {
        kv.server.close().await?;
    }
    Ok(())
}

impl Kv {
    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Create a currently-dead key.
    pub async fn create(&self, key: &str, value: &[u8], ttl: i64) -> Result<PutResponse> {
        validate_key(key)?;

        let kv = self.server.db().create(key, value, ttl)?;
        self.notifier.publish(&kv).await?;

        Ok(PutResponse {
            revision: kv.revision,
            prev_kv: prev_of(&kv),
        })
    }

    /// Update a key, optionally compare-and-swapping on `revision`.
    pub async fn put(
        &self,
        key: &str,
        value: &[u8],
        revision: i64,
        ttl: i64,
    ) -> Result<PutResponse> {
        validate_key(key)?;
        let lock = self.key_lock(key);
        let guard = lock.lock().await;

        let result = match self.server.db().modify(false, key, value, revision, ttl) {
            Ok(kv) => self.notifier.publish(&kv).await.map(|_| kv),
            Err(err) => Err(err),
        };

        drop(guard);
        drop(lock);
        self.release_key_lock(key);

        let kv = result?;
        Ok(PutResponse {
            revision: kv.revision,
            prev_kv: prev_of(&kv),
        })
    }

    /// Latest live version of a key.
    pub async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        self.server.db().get(key)
    }

    /// List latest live versions matching a key or `prefix%`.
    pub async fn list(
        &self,
        range_key: &str,
        revision: i64,
        limit: i64,
        start_key: &str,
    ) -> Result<(Vec<KeyValue>, i64)> {
        self.server.db().list(revision, limit, range_key, start_key)
    }

    /// Delete a key, optionally compare-and-swapping on `revision`. The
    /// deleted version is reported through `prev_kv`, taken from the
    /// tombstone row.
    pub async fn delete(&self, key: &str, revision: i64) -> Result<DeleteResponse> {
        validate_key(key)?;
        if key.ends_with('%') {
            return Err(Error::InvalidConfig("cannot delete a prefix".into()));
        }
        let lock = self.key_lock(key);
        let guard = lock.lock().await;

        let result = match self.server.db().modify(true, key, &[], revision, 0) {
            Ok(kv) => self.notifier.publish(&kv).await.map(|_| kv),
            Err(err) => Err(err),
        };

        drop(guard);
        drop(lock);
        self.release_key_lock(key);

        let kv = result?;
        Ok(DeleteResponse {
            revision: kv.revision,
            prev_kv: prev_of(&kv),
        })
    }

    /// Subscribe to changes of `key` (or `prefix%`) from `revision` on,
    /// served by the current leader.
    pub async fn watch(&self, key: &str, revision: i64) -> Result<mpsc::Receiver<WatchEvent>> {
        let leader = self
            .server
            .membership()
            .leader()
            .await?
            .ok_or(Error::LeaderUnknown)?;
        Client::new(&leader, self.server.cert())
            .watch(key, revision)
            .await
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .expect("key lock map mutex poisoned")
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Drop the map entry again once nobody else holds the lock.
    fn release_key_lock(&self, key: &str) {
        let mut locks = self.locks.lock().expect("key lock map mutex poisoned");
        if let Some(entry) = locks.get(key) {
            if Arc::strong_count(entry) == 1 {
                locks.remove(key);
            }
        }
    }
}

/// Project the replaced version out of a freshly written row. The first
/// version of a life cycle has nothing to report.
fn prev_of(kv: &KeyValue) -> Option<KeyValue> {
    if kv.version == 1 {
        return None;
    }
    let mut prev = kv.clone();
    prev.revision = kv.old_revision;
    prev.value = kv.old_value.clone().unwrap_or_default();
    Some(prev)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prev_of_first_version() {
        let kv = KeyValue {
            key: "foo".into(),
            revision: 7,
            version: 1,
            ..Default::default()
        };
        assert!(prev_of(&kv).is_none());
    }

    #[test]
    fn test_prev_of_later_version() {
        let kv = KeyValue {
            key: "foo".into(),
            value: vec![2],
            old_value: Some(vec![1]),
            old_revision: 7,
            revision: 9,
            version: 2,
            ..Default::default()
        };
        let prev = prev_of(&kv).unwrap();
        assert_eq!(prev.revision, 7);
        assert_eq!(prev.value, vec![1]);
    }
}
