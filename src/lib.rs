//! # revkv
//!
//! A small clustered key-value store with:
//! - Revisioned MVCC storage over a single-writer SQL backend
//! - Cluster membership with automatic voter/spare balancing
//! - Change watches with replay, fanned out from the write leader
//! - Mutual-TLS HTTP API with upgrade tunnels for engine and watch traffic
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                   Node                       │
//! │  ┌─────────┐  ┌────────────┐  ┌───────────┐  │
//! │  │ KV store│  │ membership │  │broadcaster│  │
//! │  │ (SQLite)│  │ controller │  │ (fan-out) │  │
//! │  └────┬────┘  └─────┬──────┘  └────┬──────┘  │
//! │       └──────────┬──┴──────────────┘         │
//! │             HTTP API (mTLS)                  │
//! │       /cluster   /db   /watch                │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Every mutation is tagged with a cluster-wide monotonic revision. Reads are
//! served from the local replicated view; change notifications flow to the
//! leader (forwarded over a `/watch` tunnel when the writer is a follower) and
//! are broadcast to every matching subscriber.
//!
//! ## Usage
//!
//! ### Bootstrap a node
//! ```bash
//! echo "address: localhost:9991" > /var/lib/revkv/init.yaml
//! revkvd serve --dir /var/lib/revkv
//! ```
//!
//! ### Join an existing cluster
//! ```bash
//! printf 'address: localhost:9992\ncluster: [localhost:9991]\n' > init.yaml
//! revkvd serve --dir .
//! ```
//!
//! ### Inspect the roster
//! ```bash
//! revkvd cluster --dir /var/lib/revkv
//! ```

pub mod client;
pub mod cluster;
pub mod common;
pub mod engine;
pub mod kv;
pub mod server;
pub mod store;
pub mod transport;
pub mod watch;

// Re-export commonly used types
pub use common::{Error, Result};
pub use kv::Kv;
pub use server::Server;
pub use store::{Db, KeyValue};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
