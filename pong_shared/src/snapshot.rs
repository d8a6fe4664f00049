//! Replicated body snapshots.

use serde::{Deserialize, Serialize};

use crate::{
    anim::AnimParams,
    math::{Quat, Vec3},
    world::EntityId,
};

/// A sample of one body's state, taken by its owner.
///
/// Snapshots for an entity are ordered by `sent_at`, the session clock
/// reading at the time of sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entity: EntityId,
    pub sent_at: f64,
    pub position: Vec3,
    pub velocity: Vec3,
    /// Only avatars replicate orientation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Quat>,
    #[serde(default, skip_serializing_if = "AnimParams::is_empty")]
    pub anim: AnimParams,
}

impl Snapshot {
    pub fn new(entity: EntityId, sent_at: f64, position: Vec3, velocity: Vec3) -> Self {
        Self {
            entity,
            sent_at,
            position,
            velocity,
            rotation: None,
            anim: AnimParams::new(),
        }
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = Some(rotation);
        self
    }

    pub fn with_anim(mut self, anim: AnimParams) -> Self {
        self.anim = anim;
        self
    }

    /// True if this snapshot was sampled strictly before `other`.
    /// Equal send times are not considered older.
    pub fn is_older_than(&self, other: &Snapshot) -> bool {
        self.sent_at < other.sent_at
    }

    /// Time in flight given the receiver's session clock. Negative readings
    /// caused by clock skew are reported as zero.
    pub fn transit_lag(&self, now: f64) -> f32 {
        (now - self.sent_at).max(0.0) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_send_time_is_not_older() {
        let a = Snapshot::new(EntityId(1), 2.0, Vec3::ZERO, Vec3::ZERO);
        let b = Snapshot::new(EntityId(1), 2.0, Vec3::Y, Vec3::ZERO);
        assert!(!a.is_older_than(&b));
        assert!(!b.is_older_than(&a));
    }

    #[test]
    fn transit_lag_ignores_negative_skew() {
        let s = Snapshot::new(EntityId(1), 5.0, Vec3::ZERO, Vec3::ZERO);
        assert_eq!(s.transit_lag(4.0), 0.0);
        assert!((s.transit_lag(5.25) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn ball_snapshot_omits_avatar_fields() {
        let s = Snapshot::new(EntityId(0), 1.0, Vec3::ZERO, Vec3::ZERO);
        let json = serde_json::to_string(&s).unwrap();
        assert!(!json.contains("rotation"));
        assert!(!json.contains("anim"));
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
