//! `pong_client`
//!
//! Client-side systems:
//! - Connection management (reliable + unreliable channels)
//! - Input capture driving the local avatar
//! - Snapshot publishing for owned bodies
//! - Correction of remote bodies toward their owners' snapshots

pub mod client;
pub mod input;

pub use client::GameClient;
