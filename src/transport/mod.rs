//! TLS transport primitives
//!
//! All cluster traffic runs over mutual TLS with a single shared keypair:
//! `cluster.crt` is both the server and the client certificate, and its
//! first DNS SAN is the server name every peer expects. On top of the TLS
//! sockets, HTTP/1.1 Upgrade handshakes repurpose connections as raw byte
//! tunnels for engine and watch traffic.

pub mod cert;
pub mod dial;
pub mod listen;
pub mod proxy;

pub use cert::{load_cert, Cert};
pub use dial::{dial, upgrade, Conn};
pub use listen::listen;
pub use proxy::proxy;
