//! Key-value operations
//!
//! One row per historical version of a key. A key is live when its
//! highest-revision row is not a tombstone. `create_revision` is assigned
//! exactly to the row that (re)births a key; `version` counts the rows since
//! the latest rebirth.

use rusqlite::types::ToSql;
use rusqlite::{Row, Transaction};
use serde::{Deserialize, Serialize};

use crate::common::{timestamp_now, Error, Result};

use super::Db;

/// One historical version of a key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub id: i64,
    pub key: String,
    pub value: Vec<u8>,
    pub old_value: Option<Vec<u8>>,
    pub old_revision: i64,
    pub create_revision: i64,
    pub revision: i64,
    pub ttl: i64,
    pub version: i64,
    pub del: i64,
}

const GET_SQL: &str = "SELECT id, name, value, old_value, old_revision, create_revision, revision, ttl, version, del \
     FROM key_value WHERE name = ? ORDER BY revision DESC LIMIT ?";

const LIST_SQL: &str = "\
SELECT kv.id, kv.name, kv.value, kv.old_value, kv.old_revision, kv.create_revision, kv.revision, kv.ttl, kv.version, kv.del
FROM key_value kv
  INNER JOIN (
    SELECT MAX(revision) revision, kvi.name
    FROM key_value kvi
    GROUP BY kvi.name
  ) r ON r.name = kv.name AND r.revision = kv.revision
WHERE kv.name LIKE ? ORDER BY kv.name ASC LIMIT ?";

const LIST_REVISION_SQL: &str = "\
SELECT kv.id, kv.name, kv.value, kv.old_value, kv.old_revision, kv.create_revision, kv.revision, kv.ttl, kv.version, kv.del
FROM key_value kv
  INNER JOIN (
    SELECT MAX(revision) revision, kvi.name
    FROM key_value kvi
    WHERE kvi.revision >= ?
    GROUP BY kvi.name
  ) r ON r.name = kv.name AND r.revision = kv.revision
WHERE kv.name LIKE ? ORDER BY kv.name ASC LIMIT ?";

const LIST_RESUME_SQL: &str = "\
SELECT kv.id, kv.name, kv.value, kv.old_value, kv.old_revision, kv.create_revision, kv.revision, kv.ttl, kv.version, kv.del
FROM key_value kv
  INNER JOIN (
    SELECT MAX(revision) revision, kvi.name
    FROM key_value kvi
    WHERE kvi.revision <= ?
    GROUP BY kvi.name
  ) r ON r.name = kv.name AND r.revision = kv.revision
WHERE kv.name LIKE ? AND kv.name > ? ORDER BY kv.name ASC LIMIT ?";

const REPLAY_SQL: &str = "SELECT id, name, value, old_value, old_revision, create_revision, revision, ttl, version, del \
     FROM key_value WHERE name LIKE ? AND revision >= ? ORDER BY revision ASC";

const CLEANUP_TTL_SQL: &str = "DELETE FROM key_value WHERE ttl > 0 AND ttl < ?";

const TO_COMPACT_SQL: &str =
    "SELECT COUNT(*) c, name, MAX(revision) FROM key_value GROUP BY name HAVING c > 1 OR (c = 1 AND del = 1)";

const COMPACT_SQL: &str =
    "DELETE FROM key_value WHERE name = ? AND (revision < ? OR (revision = ? AND del = 1))";

// The create_revision expression resolves to the new cluster revision when
// the prior history contains no live row after the latest tombstone, and to
// NULL otherwise. The NULL trips the NOT NULL constraint, which makes Create
// atomic against a concurrent Create without explicit locks.
const CREATE_SQL: &str = "\
INSERT INTO key_value(id, name, value, old_value, old_revision, create_revision, revision, ttl, version, del)
  VALUES ((SELECT id FROM revision), ?, ?, NULL, 0,
    CASE
      WHEN (
        CASE
          WHEN (SELECT revision FROM key_value WHERE name = ? AND del = 1 UNION ALL SELECT 0 AS revision ORDER BY revision DESC LIMIT 1) = 0
            THEN (SELECT revision FROM key_value WHERE name = ? AND del = 0 UNION ALL SELECT 0 AS revision ORDER BY revision DESC LIMIT 1)
            ELSE (SELECT revision FROM key_value WHERE name = ? AND del = 0 AND revision > (SELECT MAX(revision) FROM key_value WHERE name = ? AND del = 1) UNION ALL SELECT 0 AS revision ORDER BY revision DESC LIMIT 1)
          END
        ) = 0
        THEN (SELECT id FROM revision)
        ELSE NULL
      END,
    (SELECT id FROM revision), ?, 1, 0)";

const INSERT_SQL: &str = "\
INSERT INTO key_value(name, value, old_value, old_revision, create_revision, revision, ttl, version, del)
  VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)";

impl Db {
    /// List the latest live rows for keys matching `range_key`.
    ///
    /// `range_key` is a literal key or a prefix ending in `%`. Four modes:
    /// - point get: no wildcard, `revision <= 0`
    /// - prefix at head: wildcard, `revision <= 0`
    /// - prefix at revision ("changed since"): wildcard, `revision > 0`
    /// - prefix resume (paginated snapshot): wildcard, `revision > 0`,
    ///   non-empty `start_key`
    ///
    /// Returns the rows plus the list revision: the maximum of the current
    /// cluster revision at transaction start, the highest revision seen in
    /// the result and, in resume mode, the requested revision.
    pub fn list(
        &self,
        revision: i64,
        limit: i64,
        range_key: &str,
        start_key: &str,
    ) -> Result<(Vec<KeyValue>, i64)> {
        self.tx(|tx| list_tx(tx, revision, limit, range_key, start_key))
    }

    /// Get the latest live row for a key, if any.
    pub fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let (kvs, _) = self.list(0, 1, key, "")?;
        Ok(kvs.into_iter().next())
    }

    /// Create a key that is currently dead (never existed, or deleted).
    ///
    /// `ttl` is a relative duration in seconds; it is stored as an absolute
    /// expiry. Fails with [`Error::KeyExists`] when the key is live.
    pub fn create(&self, key: &str, value: &[u8], ttl: i64) -> Result<KeyValue> {
        let ttl = if ttl > 0 { timestamp_now() + ttl } else { 0 };

        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(CREATE_SQL)?;
            let result = stmt.execute(rusqlite::params![
                key,
                value,
                key,
                key,
                key,
                key,
                ttl
            ]);
            if let Err(err) = result {
                if err.to_string().contains("key_value.create_revision") {
                    return Err(Error::KeyExists);
                }
                return Err(err.into());
            }

            let revision = conn.last_insert_rowid();
            Ok(KeyValue {
                id: revision,
                key: key.to_string(),
                value: value.to_vec(),
                create_revision: revision,
                revision,
                ttl,
                version: 1,
                ..Default::default()
            })
        })
    }

    /// Append a new version of a key, optionally as a tombstone.
    ///
    /// With `revision > 0` this is a compare-and-swap: the latest live row
    /// must carry exactly that revision. A prior live row passes down its
    /// `create_revision` and `ttl` and bumps `version`; a dead or absent key
    /// is reborn at version 1.
    pub fn modify(
        &self,
        delete: bool,
        key: &str,
        value: &[u8],
        revision: i64,
        ttl: i64,
    ) -> Result<KeyValue> {
        self.tx(|tx| {
            let old = get_tx(tx, key)?;

            if revision > 0 {
                match &old {
                    None => return Err(Error::NotExists),
                    Some(old) if old.revision != revision => return Err(Error::RevisionMismatch),
                    Some(_) => {}
                }
            }

            let ttl = if ttl > 0 { timestamp_now() + ttl } else { 0 };
            let new_revision = new_revision(tx)?;

            let mut result = KeyValue {
                key: key.to_string(),
                value: value.to_vec(),
                revision: new_revision,
                ttl,
                create_revision: new_revision,
                version: 1,
                ..Default::default()
            };
            if let Some(old) = old {
                result.old_revision = old.revision;
                result.old_value = Some(old.value);
                result.ttl = old.ttl;
                result.create_revision = old.create_revision;
                result.version = old.version + 1;
            }
            if delete {
                result.del = 1;
            }

            tx.execute(
                INSERT_SQL,
                rusqlite::params![
                    result.key,
                    result.value,
                    result.old_value,
                    result.old_revision,
                    result.create_revision,
                    result.revision,
                    result.ttl,
                    result.version,
                    result.del,
                ],
            )?;

            Ok(result)
        })
    }

    /// Purge expired TTL entries and collapse redundant history.
    ///
    /// Keeps the most recent row of every live key; a key whose only
    /// remaining row is a tombstone loses that row too.
    pub fn cleanup(&self) -> Result<()> {
        self.tx(|tx| {
            tx.execute(CLEANUP_TTL_SQL, [timestamp_now()])?;

            let mut stmt = tx.prepare_cached(TO_COMPACT_SQL)?;
            let targets = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            for (name, revision) in targets {
                tx.execute(COMPACT_SQL, rusqlite::params![name, revision, revision])?;
            }

            Ok(())
        })
    }

    /// Every row for the (prefix-or-exact) key with revision >= `revision`,
    /// ordered by revision ascending. Used to backfill watchers.
    pub fn replay(&self, key: &str, revision: i64) -> Result<Vec<KeyValue>> {
        self.tx(|tx| {
            let mut stmt = tx.prepare_cached(REPLAY_SQL)?;
            let rows = stmt
                .query_map(rusqlite::params![key, revision], row_to_kv)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Current cluster revision.
    pub fn current_revision(&self) -> Result<i64> {
        self.tx(|tx| current_revision(tx))
    }
}

fn list_tx(
    tx: &Transaction,
    revision: i64,
    limit: i64,
    range_key: &str,
    start_key: &str,
) -> Result<(Vec<KeyValue>, i64)> {
    // Limit 0 means effectively unlimited; otherwise fetch one extra row so
    // callers can detect that more results are available.
    let limit = if limit == 0 { 1_000_000 } else { limit + 1 };

    let mut list_revision = current_revision(tx)?;

    let rows = if !range_key.ends_with('%') && revision <= 0 {
        query_rows(tx, GET_SQL, &[&range_key, &1i64])?
    } else if revision <= 0 {
        query_rows(tx, LIST_SQL, &[&range_key, &limit])?
    } else if !start_key.is_empty() {
        list_revision = revision;
        query_rows(
            tx,
            LIST_RESUME_SQL,
            &[&revision, &range_key, &start_key, &limit],
        )?
    } else {
        query_rows(tx, LIST_REVISION_SQL, &[&revision, &range_key, &limit])?
    };

    let mut resp = Vec::new();
    for kv in rows {
        if kv.revision > list_revision {
            list_revision = kv.revision;
        }
        if kv.del == 0 {
            resp.push(kv);
        }
    }

    Ok((resp, list_revision))
}

fn get_tx(tx: &Transaction, key: &str) -> Result<Option<KeyValue>> {
    let (kvs, _) = list_tx(tx, 0, 1, key, "")?;
    Ok(kvs.into_iter().next())
}

fn query_rows(tx: &Transaction, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<KeyValue>> {
    let mut stmt = tx.prepare_cached(sql)?;
    let rows = stmt
        .query_map(params, row_to_kv)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn row_to_kv(row: &Row) -> rusqlite::Result<KeyValue> {
    Ok(KeyValue {
        id: row.get(0)?,
        key: row.get(1)?,
        value: row.get::<_, Option<Vec<u8>>>(2)?.unwrap_or_default(),
        old_value: row.get(3)?,
        old_revision: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
        create_revision: row.get(5)?,
        revision: row.get(6)?,
        ttl: row.get::<_, Option<i64>>(7)?.unwrap_or(0),
        version: row.get::<_, Option<i64>>(8)?.unwrap_or(0),
        del: row.get::<_, Option<i64>>(9)?.unwrap_or(0),
    })
}

fn current_revision(tx: &Transaction) -> Result<i64> {
    let revision: i64 = tx.query_row("SELECT id FROM revision", [], |row| row.get(0))?;
    if revision == 0 {
        panic!("current revision is 0");
    }
    Ok(revision)
}

fn new_revision(tx: &Transaction) -> Result<i64> {
    tx.execute("DELETE FROM revision", [])?;
    tx.execute("INSERT INTO revision(t) VALUES(NULL)", [])?;
    Ok(tx.last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_db() -> Db {
        let db = Db::open_in_memory().unwrap();
        db.create_schema().unwrap();
        db
    }

    #[test]
    fn test_create() {
        let db = new_db();

        let kv = db.create("foo", &[1, 2, 3], 0).unwrap();
        assert_eq!(kv.key, "foo");
        assert_eq!(kv.version, 1);
        assert_eq!(kv.create_revision, kv.revision);
        assert!(kv.revision > 0);
    }

    #[test]
    fn test_create_key_exists() {
        let db = new_db();

        db.create("foo", &[1, 2, 3], 0).unwrap();
        let err = db.create("foo", &[1, 2, 3], 0).unwrap_err();
        assert!(matches!(err, Error::KeyExists));
    }

    #[test]
    fn test_create_again_after_delete() {
        let db = new_db();

        let kv = db.create("foo", &[1, 2, 3], 0).unwrap();
        let tomb = db.modify(true, "foo", &[], kv.revision, 0).unwrap();
        assert!(tomb.revision > kv.revision);

        let reborn = db.create("foo", &[9], 0).unwrap();
        assert_eq!(reborn.version, 1);
        assert_eq!(reborn.create_revision, reborn.revision);
        assert!(reborn.revision > tomb.revision);
    }

    #[test]
    fn test_revisions_monotonic() {
        let db = new_db();

        let mut last = 0;
        for i in 0..10 {
            let kv = if i % 2 == 0 {
                db.create(&format!("key-{}", i), b"v", 0).unwrap()
            } else {
                db.modify(false, &format!("key-{}", i - 1), b"w", 0, 0).unwrap()
            };
            assert!(kv.revision > last);
            last = kv.revision;
        }
    }

    #[test]
    fn test_modify_carries_history() {
        let db = new_db();

        let kv = db.create("foo", &[1], 0).unwrap();
        let kv2 = db.modify(false, "foo", &[2], kv.revision, 0).unwrap();

        assert_eq!(kv2.version, 2);
        assert_eq!(kv2.create_revision, kv.create_revision);
        assert_eq!(kv2.old_revision, kv.revision);
        assert_eq!(kv2.old_value.as_deref(), Some(&[1][..]));
    }

    #[test]
    fn test_modify_cas() {
        let db = new_db();

        let kv = db.create("foo", &[1], 0).unwrap();
        db.modify(false, "foo", &[2], kv.revision, 0).unwrap();

        // Stale revision
        let err = db.modify(false, "foo", &[3], kv.revision, 0).unwrap_err();
        assert!(matches!(err, Error::RevisionMismatch));

        // Dead key
        let err = db.modify(false, "missing", &[3], 42, 0).unwrap_err();
        assert!(matches!(err, Error::NotExists));
    }

    #[test]
    fn test_get_excludes_tombstones() {
        let db = new_db();

        let kv = db.create("foo", &[1], 0).unwrap();
        assert!(db.get("foo").unwrap().is_some());

        db.modify(true, "foo", &[], kv.revision, 0).unwrap();
        assert!(db.get("foo").unwrap().is_none());
    }

    #[test]
    fn test_list_prefix() {
        let db = new_db();

        db.create("a/1", &[1], 0).unwrap();
        db.create("a/2", &[2], 0).unwrap();
        db.create("b/1", &[3], 0).unwrap();

        let (kvs, rev) = db.list(0, 0, "a/%", "").unwrap();
        assert_eq!(kvs.len(), 2);
        assert_eq!(kvs[0].key, "a/1");
        assert_eq!(kvs[1].key, "a/2");
        assert!(rev >= kvs[1].revision);
    }

    #[test]
    fn test_list_at_revision() {
        let db = new_db();

        db.create("a/1", &[1], 0).unwrap();
        let kv2 = db.create("a/2", &[2], 0).unwrap();
        let kv3 = db.create("a/3", &[3], 0).unwrap();

        // Only keys whose latest mutation is >= kv2.revision
        let (kvs, rev) = db.list(kv2.revision, 0, "a/%", "").unwrap();
        assert_eq!(kvs.len(), 2);
        assert_eq!(kvs[0].key, "a/2");
        assert_eq!(kvs[1].key, "a/3");
        assert!(rev >= kv3.revision);
        for kv in &kvs {
            assert!(kv.revision >= kv2.revision);
        }
    }

    #[test]
    fn test_list_resume() {
        let db = new_db();

        db.create("a/1", &[1], 0).unwrap();
        let kv2 = db.create("a/2", &[2], 0).unwrap();
        db.create("a/3", &[3], 0).unwrap();

        // Snapshot at kv2.revision, resuming after a/1: a/3 is too new.
        let (kvs, rev) = db.list(kv2.revision, 0, "a/%", "a/1").unwrap();
        assert_eq!(kvs.len(), 1);
        assert_eq!(kvs[0].key, "a/2");
        assert_eq!(rev, kv2.revision);
    }

    #[test]
    fn test_list_limit_fetches_one_extra() {
        let db = new_db();

        db.create("a/1", &[1], 0).unwrap();
        db.create("a/2", &[2], 0).unwrap();
        db.create("a/3", &[3], 0).unwrap();

        let (kvs, _) = db.list(0, 2, "a/%", "").unwrap();
        assert_eq!(kvs.len(), 3); // limit + 1, so callers can detect more
    }

    #[test]
    fn test_replay() {
        let db = new_db();

        let kv1 = db.create("foo", &[1], 0).unwrap();
        let kv2 = db.modify(false, "foo", &[2], 0, 0).unwrap();
        let kv3 = db.modify(true, "foo", &[], 0, 0).unwrap();

        let rows = db.replay("foo", kv1.revision).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].revision, kv1.revision);
        assert_eq!(rows[1].revision, kv2.revision);
        assert_eq!(rows[2].revision, kv3.revision);
        assert_eq!(rows[2].del, 1);

        let rows = db.replay("foo", kv2.revision).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_cleanup_preserves_latest_live() {
        let db = new_db();

        db.create("foo", &[1], 0).unwrap();
        db.modify(false, "foo", &[2], 0, 0).unwrap();
        let last = db.modify(false, "foo", &[3], 0, 0).unwrap();

        db.cleanup().unwrap();

        let rows = db.replay("foo", 0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].revision, last.revision);
        assert_eq!(rows[0].value, vec![3]);
    }

    #[test]
    fn test_cleanup_erases_dangling_tombstone() {
        let db = new_db();

        let kv = db.create("foo", &[1], 0).unwrap();
        db.modify(true, "foo", &[], kv.revision, 0).unwrap();

        db.cleanup().unwrap();

        let rows = db.replay("foo", 0).unwrap();
        assert!(rows.is_empty());

        // The key can be born again from scratch.
        let reborn = db.create("foo", &[2], 0).unwrap();
        assert_eq!(reborn.version, 1);
    }
}
