//! Integration tests for the revisioned KV store

use std::time::Duration;

use revkv::store::Db;
use revkv::Error;
use tempfile::TempDir;

fn open_db(dir: &TempDir) -> Db {
    Db::open(dir.path().join("kv.db")).unwrap()
}

#[test]
fn test_create_then_create_fails() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.create_schema().unwrap();

    let kv = db.create("foo", &[1, 2, 3], 0).unwrap();
    assert!(kv.revision > 0);
    assert_eq!(kv.version, 1);

    let err = db.create("foo", &[1, 2, 3], 0).unwrap_err();
    assert!(matches!(err, Error::KeyExists));
}

#[test]
fn test_delete_then_create_rebirths() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.create_schema().unwrap();

    let kv = db.create("foo", &[1, 2, 3], 0).unwrap();
    let tomb = db.modify(true, "foo", &[], kv.revision, 0).unwrap();
    assert!(tomb.revision > kv.revision);
    assert_eq!(tomb.del, 1);

    let reborn = db.create("foo", &[9], 0).unwrap();
    assert!(reborn.revision > tomb.revision);
    assert_eq!(reborn.version, 1);
    assert_eq!(reborn.create_revision, reborn.revision);
}

#[test]
fn test_ttl_expiry() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.create_schema().unwrap();

    db.create("k", &[1], 1).unwrap();
    assert!(db.get("k").unwrap().is_some());

    std::thread::sleep(Duration::from_secs(2));
    db.cleanup().unwrap();

    assert!(db.get("k").unwrap().is_none());

    let reborn = db.create("k", &[2], 0).unwrap();
    assert_eq!(reborn.version, 1);
}

#[test]
fn test_persistence_across_reopen() {
    let dir = TempDir::new().unwrap();

    let revision = {
        let db = open_db(&dir);
        db.create_schema().unwrap();
        let kv = db.create("foo", &[1], 0).unwrap();
        db.modify(false, "foo", &[2], kv.revision, 0).unwrap().revision
    };

    let db = open_db(&dir);
    let kv = db.get("foo").unwrap().unwrap();
    assert_eq!(kv.revision, revision);
    assert_eq!(kv.value, vec![2]);
    assert_eq!(kv.version, 2);

    // The revision counter continues where it left off.
    let next = db.create("bar", &[3], 0).unwrap();
    assert!(next.revision > revision);
}

#[test]
fn test_list_revision_is_monotonic() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.create_schema().unwrap();

    let mut last = 0;
    for i in 0..5 {
        db.create(&format!("seq/{}", i), &[i as u8], 0).unwrap();
        let (_, list_revision) = db.list(0, 0, "seq/%", "").unwrap();
        assert!(list_revision > last);
        last = list_revision;
    }
}

#[test]
fn test_replay_completeness_per_key() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.create_schema().unwrap();

    let first = db.create("watched", &[0], 0).unwrap();
    for i in 1..=4 {
        db.modify(false, "watched", &[i], 0, 0).unwrap();
    }
    db.create("other", &[9], 0).unwrap();

    let rows = db.replay("watched", first.revision).unwrap();
    assert_eq!(rows.len(), 5);
    for pair in rows.windows(2) {
        assert!(pair[0].revision < pair[1].revision);
    }
    assert!(rows.iter().all(|kv| kv.key == "watched"));
}

#[test]
fn test_cleanup_collapses_history_only() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir);
    db.create_schema().unwrap();

    // live key with history, live key without, deleted key
    let a = db.create("a", &[1], 0).unwrap();
    db.modify(false, "a", &[2], a.revision, 0).unwrap();
    db.create("b", &[1], 0).unwrap();
    let c = db.create("c", &[1], 0).unwrap();
    db.modify(true, "c", &[], c.revision, 0).unwrap();

    db.cleanup().unwrap();

    let (kvs, _) = db.list(0, 0, "%", "").unwrap();
    let keys: Vec<&str> = kvs.iter().map(|kv| kv.key.as_str()).collect();
    assert_eq!(keys, vec!["a", "b"]);

    // Exactly one row left per live key, revisions unchanged.
    assert_eq!(db.replay("a", 0).unwrap().len(), 1);
    assert_eq!(db.replay("b", 0).unwrap().len(), 1);
    assert!(db.replay("c", 0).unwrap().is_empty());
    assert_eq!(db.get("a").unwrap().unwrap().value, vec![2]);
}
