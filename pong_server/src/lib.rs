//! `pong_server`
//!
//! Session relay:
//! - Authoritative session clock
//! - Peer admission, avatar and ball spawning
//! - Ownership authority
//! - Snapshot fan-out
//!
//! Networking model:
//! - TCP: handshake/control plane
//! - UDP: replication plane (snapshots)

pub mod server;

pub use server::GameServer;
