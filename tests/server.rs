//! Integration tests for a running node
//!
//! Every test gets its own node directory seeded with a freshly generated
//! cluster certificate and an init.yaml, and its own port.

use std::path::Path;
use std::sync::Arc;

use revkv::client::Client;
use revkv::engine::{derive_node_id, BOOTSTRAP_ID};
use revkv::server::{Init, Server};
use revkv::store::KeyValue;
use revkv::transport;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

/// Write a self-signed `localhost` keypair usable as server certificate,
/// client certificate and trust root at once.
fn write_cluster_cert(dir: &Path) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    std::fs::write(dir.join("cluster.crt"), cert.cert.pem()).unwrap();
    std::fs::write(dir.join("cluster.key"), cert.key_pair.serialize_pem()).unwrap();
}

fn new_dir_with_init(address: &str, cluster: &[&str]) -> TempDir {
    let dir = TempDir::new().unwrap();
    write_cluster_cert(dir.path());

    let init = Init {
        address: address.to_string(),
        cluster: cluster.iter().map(|s| s.to_string()).collect(),
    };
    std::fs::write(
        dir.path().join("init.yaml"),
        serde_yaml::to_string(&init).unwrap(),
    )
    .unwrap();

    dir
}

#[tokio::test]
async fn test_bootstrap_node_serves_cluster() {
    let addr = "localhost:19991";
    let dir = new_dir_with_init(addr, &[]);

    let server = Server::new(dir.path()).await.unwrap();
    assert_eq!(server.address(), addr);
    assert_eq!(server.id(), BOOTSTRAP_ID);

    let client = Client::new(addr, server.cert());
    let servers = client.servers().await.unwrap();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].address, addr);
    assert_eq!(servers[0].id, BOOTSTRAP_ID);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_second_node_joins() {
    let addr_a = "localhost:19992";
    let addr_b = "localhost:19993";

    let dir_a = new_dir_with_init(addr_a, &[]);
    let server_a = Server::new(dir_a.path()).await.unwrap();

    let dir_b = new_dir_with_init(addr_b, &[addr_a]);
    let server_b = Server::new(dir_b.path()).await.unwrap();

    // The joiner derives its id from its own address.
    assert_eq!(server_b.id(), derive_node_id(addr_b));

    let client = Client::new(addr_a, server_a.cert());
    let servers = client.servers().await.unwrap();
    assert_eq!(servers.len(), 2);
    let joined = servers.iter().find(|s| s.address == addr_b).unwrap();
    assert_eq!(joined.id, derive_node_id(addr_b));

    server_b.close().await.unwrap();
    server_a.close().await.unwrap();
}

#[tokio::test]
async fn test_restart_keeps_identity() {
    let addr = "localhost:19994";
    let dir = new_dir_with_init(addr, &[]);

    {
        let server = Server::new(dir.path()).await.unwrap();
        server.close().await.unwrap();
    }

    // init.yaml was consumed, info.yaml took its place.
    assert!(!dir.path().join("init.yaml").exists());
    assert!(dir.path().join("info.yaml").exists());

    let server = Server::new(dir.path()).await.unwrap();
    assert_eq!(server.id(), BOOTSTRAP_ID);

    let client = Client::new(addr, server.cert());
    let servers = client.servers().await.unwrap();
    assert_eq!(servers.len(), 1);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_watch_receives_creates() {
    let addr = "localhost:19995";
    let dir = new_dir_with_init(addr, &[]);

    let kv = revkv::kv::open(dir.path()).await.unwrap();

    // One node per process: reopening returns the same handle.
    let again = revkv::kv::open(dir.path()).await.unwrap();
    assert!(Arc::ptr_eq(&kv, &again));

    let mut events = kv.watch("a%", 0).await.unwrap();
    assert!(events.recv().await.unwrap().start);

    let r1 = kv.create("a/1", &[1], 0).await.unwrap().revision;
    let r2 = kv.create("a/2", &[2], 0).await.unwrap().revision;
    kv.create("b/1", &[3], 0).await.unwrap(); // filtered out

    let first = events.recv().await.unwrap().kv.unwrap();
    assert_eq!(first.key, "a/1");
    assert_eq!(first.revision, r1);

    let second = events.recv().await.unwrap().kv.unwrap();
    assert_eq!(second.key, "a/2");
    assert_eq!(second.revision, r2);
    assert!(second.revision > first.revision);

    revkv::kv::shutdown().await.unwrap();
}

#[tokio::test]
async fn test_watch_replay_then_live() {
    let addr = "localhost:19996";
    let dir = new_dir_with_init(addr, &[]);
    let server = Server::new(dir.path()).await.unwrap();
    let db = server.db();

    let r1 = db.create("h/1", &[1], 0).unwrap().revision;
    let r2 = db.modify(false, "h/1", &[2], 0, 0).unwrap().revision;

    let client = Client::new(addr, server.cert());
    let mut events = client.watch("h/%", r1).await.unwrap();
    assert!(events.recv().await.unwrap().start);

    // Backfilled history first, in revision order.
    assert_eq!(events.recv().await.unwrap().kv.unwrap().revision, r1);
    assert_eq!(events.recv().await.unwrap().kv.unwrap().revision, r2);

    // Then live traffic.
    let live = db.modify(false, "h/1", &[3], 0, 0).unwrap();
    server.notify(live.clone()).await.unwrap();
    let event = events.recv().await.unwrap().kv.unwrap();
    assert_eq!(event.revision, live.revision);
    assert_eq!(event.value, vec![3]);

    server.close().await.unwrap();
}

#[tokio::test]
async fn test_watch_forwarding_ingest() {
    let addr = "localhost:19997";
    let dir = new_dir_with_init(addr, &[]);
    let server = Server::new(dir.path()).await.unwrap();
    let cert = server.cert();

    let client = Client::new(addr, cert.clone());
    let mut events = client.watch("fwd/%", 0).await.unwrap();
    assert!(events.recv().await.unwrap().start);

    // A follower announces a committed mutation over the POST tunnel.
    let mut tunnel = transport::upgrade(&cert, addr, "POST", "/watch", "watch", &[])
        .await
        .unwrap();
    let kv = KeyValue {
        key: "fwd/1".to_string(),
        value: vec![7],
        create_revision: 42,
        revision: 42,
        version: 1,
        ..Default::default()
    };
    let mut frame = serde_json::to_vec(&kv).unwrap();
    frame.push(b'\n');
    tunnel.write_all(&frame).await.unwrap();
    tunnel.flush().await.unwrap();

    let event = events.recv().await.unwrap().kv.unwrap();
    assert_eq!(event.key, "fwd/1");
    assert_eq!(event.revision, 42);

    server.close().await.unwrap();
}
