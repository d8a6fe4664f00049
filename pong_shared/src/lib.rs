//! `pong_shared`
//!
//! Shared libraries used by both client and relay.
//!
//! Design goals:
//! - Deterministic and modular where practical.
//! - Clear separation of concerns (net, sync, world, math, physics).
//! - Traits at the engine seams (`NetworkedBody`, `PhysicsBackend`,
//!   `SnapshotTransport`, `Clock`).
//! - No `unsafe`.

pub mod anim;
pub mod clock;
pub mod config;
pub mod math;
pub mod net;
pub mod physics;
pub mod snapshot;
pub mod sync;
pub mod world;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::clock::*;
    pub use crate::config::*;
    pub use crate::math::*;
    pub use crate::net::*;
    pub use crate::snapshot::*;
    pub use crate::sync::*;
    pub use crate::world::*;
}
