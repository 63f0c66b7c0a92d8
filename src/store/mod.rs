//! Revisioned key-value storage over a single-writer SQL backend
//!
//! Every mutation appends a new row tagged with a fresh cluster-wide
//! revision; reads project the latest live version per key. Deletes are
//! tombstones, TTL expiry and compaction garbage-collect history.

pub mod kv;
pub mod schema;

pub use kv::KeyValue;

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, Transaction};

use crate::common::{Error, Result};

/// Attempts made against a busy database before giving up.
const BUSY_RETRIES: usize = 250;

/// Handle to the cluster database.
///
/// The backend is opened with exactly one connection; the connection itself
/// serialises writers. Do not wrap this in a pool.
pub struct Db {
    conn: Mutex<Option<Connection>>,
}

impl Db {
    /// Open the cluster database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Open an in-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Close the connection. Later operations fail with an error.
    pub fn close(&self) -> Result<()> {
        let conn = self.conn.lock().expect("database mutex poisoned").take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, err)| Error::Sql(err))?;
        }
        Ok(())
    }

    /// Executes the given function within a database transaction.
    ///
    /// Transient busy/locked failures are retried; the transaction is rolled
    /// back (by drop) when the function fails.
    fn tx<T>(&self, f: impl Fn(&Transaction) -> Result<T>) -> Result<T> {
        retry(|| {
            let mut guard = self.conn.lock().expect("database mutex poisoned");
            let conn = guard.as_mut().ok_or_else(closed)?;
            let tx = conn.transaction().map_err(Error::from)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    /// Run a closure against the raw connection, with busy retry.
    fn with_conn<T>(&self, f: impl Fn(&Connection) -> Result<T>) -> Result<T> {
        retry(|| {
            let guard = self.conn.lock().expect("database mutex poisoned");
            let conn = guard.as_ref().ok_or_else(closed)?;
            f(conn)
        })
    }
}

fn closed() -> Error {
    Error::Internal("database is closed".into())
}

/// Retry transient database errors.
fn retry<T>(f: impl Fn() -> Result<T>) -> Result<T> {
    let mut last = None;
    for _ in 0..BUSY_RETRIES {
        match f() {
            Ok(out) => return Ok(out),
            Err(err) if err.is_retryable() => {
                std::thread::sleep(Duration::from_millis(1));
                last = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last.unwrap_or_else(|| Error::Internal("retry budget exhausted".into())))
}
