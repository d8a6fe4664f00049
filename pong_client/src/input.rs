//! Input handling.
//!
//! In a real game this would come from the VR rig. Here input is sampled per
//! tick and turned into avatar motion: planar velocity plus yaw, and a
//! `Speed` animator parameter that remote peers replicate.

use pong_shared::{
    anim::AnimValue,
    math::{Quat, Vec3},
    world::{Body, NetworkedBody},
};

/// Walking speed in m/s at full stick deflection.
pub const MOVE_SPEED: f32 = 2.0;
/// Turn rate in rad/s at full deflection.
pub const TURN_RATE: f32 = 2.5;

/// User input state at a moment in time.
#[derive(Debug, Clone, Copy, Default)]
pub struct InputState {
    pub forward: f32,
    pub right: f32,
    pub turn: f32,
}

impl InputState {
    /// Movement intent in avatar-local space, clamped to unit length.
    pub fn wish_vector(self) -> Vec3 {
        let wish = Vec3::new(self.right, 0.0, self.forward);
        if wish.len_sq() > 1.0 {
            wish.normalize_or_zero()
        } else {
            wish
        }
    }
}

/// Drives the local avatar for one tick.
pub fn apply_input(avatar: &mut Body, input: InputState, dt: f32) {
    let mut pose = avatar.pose();
    let yaw = Quat::from_axis_angle(Vec3::Y, input.turn.clamp(-1.0, 1.0) * TURN_RATE * dt);
    pose.rotation = rotate_quat(yaw, pose.rotation);
    avatar.set_pose(pose);

    let local = input.wish_vector() * MOVE_SPEED;
    let velocity = rotate_vec(pose.rotation, local);
    avatar.set_velocity(velocity);
    avatar
        .anim
        .set("Speed", AnimValue::Float(velocity.len()));
}

/// Hamilton product `a * b`.
fn rotate_quat(a: Quat, b: Quat) -> Quat {
    Quat::new(
        a.w * b.x + a.x * b.w + a.y * b.z - a.z * b.y,
        a.w * b.y - a.x * b.z + a.y * b.w + a.z * b.x,
        a.w * b.z + a.x * b.y - a.y * b.x + a.z * b.w,
        a.w * b.w - a.x * b.x - a.y * b.y - a.z * b.z,
    )
    .normalize()
}

/// Rotates `v` by unit quaternion `q`.
fn rotate_vec(q: Quat, v: Vec3) -> Vec3 {
    let u = Vec3::new(q.x, q.y, q.z);
    let uv = cross(u, v);
    let uuv = cross(u, uv);
    v + (uv * q.w + uuv) * 2.0
}

fn cross(a: Vec3, b: Vec3) -> Vec3 {
    Vec3::new(
        a.y * b.z - a.z * b.y,
        a.z * b.x - a.x * b.z,
        a.x * b.y - a.y * b.x,
    )
}
