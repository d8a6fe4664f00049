//! Physics abstraction.
//!
//! Synchronizers only nudge bodies; integration happens here. The built-in
//! stepper is gravity plus a bouncy floor, which is all the table needs for
//! headless play and tests.

use crate::{math::Vec3, world::World};

/// Physics parameters.
#[derive(Debug, Clone, Copy)]
pub struct PhysicsConfig {
    pub gravity: Vec3,
    /// Height of the floor plane.
    pub floor_y: f32,
    /// Fraction of vertical speed kept after a bounce.
    pub restitution: f32,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            gravity: Vec3::new(0.0, -9.81, 0.0),
            floor_y: 0.0,
            restitution: 0.85,
        }
    }
}

/// Physics stepper trait.
pub trait PhysicsBackend: Send + Sync {
    fn step(&mut self, world: &mut World, dt_sec: f32);
}

/// Semi-implicit Euler with a floor bounce.
#[derive(Default)]
pub struct SimplePhysics {
    pub cfg: PhysicsConfig,
}

impl SimplePhysics {
    pub fn new(cfg: PhysicsConfig) -> Self {
        Self { cfg }
    }
}

impl PhysicsBackend for SimplePhysics {
    fn step(&mut self, world: &mut World, dt_sec: f32) {
        for (_, body) in world.iter_mut() {
            let rb = &mut body.rigid;
            if !rb.kinematic {
                rb.velocity += self.cfg.gravity * dt_sec;
            }
            rb.pose.position += rb.velocity * dt_sec;

            let floor = self.cfg.floor_y + rb.radius;
            if rb.pose.position.y < floor {
                rb.pose.position.y = floor;
                if rb.velocity.y < 0.0 {
                    rb.velocity.y = -rb.velocity.y * self.cfg.restitution;
                }
            }
        }
    }
}
