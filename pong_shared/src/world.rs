//! Networked bodies and the per-peer world that holds them.
//!
//! The world is a flat map keyed by entity id. A `BTreeMap` keeps iteration
//! order stable across peers, which keeps per-tick processing deterministic.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    anim::AnimParams,
    math::{Quat, Vec3},
};

/// Opaque entity id, assigned by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

/// Identifies a peer in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u32);

/// What a networked body represents; selects the sync profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BodyKind {
    Ball,
    Avatar,
}

/// Position and orientation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Pose {
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
        }
    }
}

/// Capabilities a synchronizer needs from a simulated body.
///
/// Engines implement this for their own transform/rigid-body types; the
/// synchronizer never touches anything else.
pub trait NetworkedBody {
    fn pose(&self) -> Pose;
    fn set_pose(&mut self, pose: Pose);
    fn velocity(&self) -> Vec3;
    fn set_velocity(&mut self, velocity: Vec3);

    /// Animator parameters to replicate, if the body has an animator.
    fn animation(&self) -> Option<&AnimParams> {
        None
    }

    /// Applies replicated animator parameters.
    fn set_animation(&mut self, _params: &AnimParams) {}

    fn position(&self) -> Vec3 {
        self.pose().position
    }

    fn set_position(&mut self, position: Vec3) {
        let mut pose = self.pose();
        pose.position = position;
        self.set_pose(pose);
    }
}

/// Minimal rigid body state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RigidBody {
    pub pose: Pose,
    pub velocity: Vec3,
    /// Collision radius used by the floor test.
    pub radius: f32,
    /// Kinematic bodies are moved only by code, never by gravity.
    pub kinematic: bool,
}

impl Default for RigidBody {
    fn default() -> Self {
        Self {
            pose: Pose::default(),
            velocity: Vec3::ZERO,
            radius: 0.02,
            kinematic: false,
        }
    }
}

impl RigidBody {
    pub fn at(position: Vec3) -> Self {
        Self {
            pose: Pose::at(position),
            ..Default::default()
        }
    }
}

impl NetworkedBody for RigidBody {
    fn pose(&self) -> Pose {
        self.pose
    }

    fn set_pose(&mut self, pose: Pose) {
        self.pose = pose;
    }

    fn velocity(&self) -> Vec3 {
        self.velocity
    }

    fn set_velocity(&mut self, velocity: Vec3) {
        self.velocity = velocity;
    }
}

/// A body in the world plus its replication metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Body {
    pub kind: BodyKind,
    /// Current authority. `None` until the relay assigns one.
    pub owner: Option<PeerId>,
    pub rigid: RigidBody,
    pub anim: AnimParams,
}

impl Body {
    pub fn new(kind: BodyKind, owner: Option<PeerId>, rigid: RigidBody) -> Self {
        Self {
            kind,
            owner,
            rigid,
            anim: AnimParams::new(),
        }
    }

    pub fn is_owned_by(&self, peer: PeerId) -> bool {
        self.owner == Some(peer)
    }
}

impl NetworkedBody for Body {
    fn pose(&self) -> Pose {
        self.rigid.pose
    }

    fn set_pose(&mut self, pose: Pose) {
        self.rigid.pose = pose;
    }

    fn velocity(&self) -> Vec3 {
        self.rigid.velocity
    }

    fn set_velocity(&mut self, velocity: Vec3) {
        self.rigid.velocity = velocity;
    }

    fn animation(&self) -> Option<&AnimParams> {
        match self.kind {
            BodyKind::Avatar => Some(&self.anim),
            BodyKind::Ball => None,
        }
    }

    fn set_animation(&mut self, params: &AnimParams) {
        self.anim.merge_from(params);
    }
}

/// All networked bodies known to one peer.
#[derive(Debug, Default)]
pub struct World {
    bodies: BTreeMap<EntityId, Body>,
}

impl World {
    /// Inserts/replaces a body under a relay-assigned id.
    pub fn insert(&mut self, id: EntityId, body: Body) {
        self.bodies.insert(id, body);
    }

    pub fn remove(&mut self, id: EntityId) -> Option<Body> {
        self.bodies.remove(&id)
    }

    pub fn get(&self, id: EntityId) -> Option<&Body> {
        self.bodies.get(&id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Body> {
        self.bodies.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &Body)> {
        self.bodies.iter().map(|(k, v)| (*k, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EntityId, &mut Body)> {
        self.bodies.iter_mut().map(|(k, v)| (*k, v))
    }

    /// Ids of bodies owned by `peer`, in id order.
    pub fn owned_by(&self, peer: PeerId) -> Vec<EntityId> {
        self.iter()
            .filter(|(_, b)| b.is_owned_by(peer))
            .map(|(id, _)| id)
            .collect()
    }

    /// First body of a kind, restricted to `owner` when one is given.
    pub fn find(&self, kind: BodyKind, owner: Option<PeerId>) -> Option<EntityId> {
        self.iter()
            .find(|(_, b)| b.kind == kind && (owner.is_none() || b.owner == owner))
            .map(|(id, _)| id)
    }
}
