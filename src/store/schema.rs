//! Database schema
//!
//! The `revision` table holds exactly one row whose autoincrement id is the
//! current cluster revision. The after-insert trigger replaces that row after
//! every insert into `key_value`, so the revision counter is bumped by the
//! SQL engine itself and a race-free `Create` can embed "allocate revision"
//! into a single statement.

use crate::common::Result;

use super::Db;

const SCHEMA: &[&str] = &[
    "CREATE TABLE key_value (
        name TEXT,
        value BLOB,
        create_revision INTEGER NOT NULL,
        revision INTEGER NOT NULL,
        ttl INTEGER,
        version INTEGER,
        del INTEGER,
        old_value BLOB,
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        old_revision INTEGER
    )",
    "CREATE INDEX name_idx ON key_value (name)",
    "CREATE INDEX revision_idx ON key_value (revision)",
    "CREATE INDEX name_del_revision_idx ON key_value (name, del, revision)",
    "CREATE TABLE revision (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        t TEXT
    )",
    // Initial revision will be 1
    "INSERT INTO revision(t) VALUES(NULL)",
    "CREATE TRIGGER key_value_revision
        AFTER INSERT ON key_value
        FOR EACH ROW
        WHEN NEW.id IS NOT NULL
        BEGIN
            DELETE FROM revision;
            INSERT INTO revision(t) VALUES(NULL);
        END",
];

impl Db {
    /// Initializes the database schema.
    pub fn create_schema(&self) -> Result<()> {
        self.tx(|tx| {
            for stmt in SCHEMA {
                tx.execute(stmt, [])?;
            }
            Ok(())
        })
    }
}
