//! Authority-side sampling.

use crate::{
    snapshot::Snapshot,
    world::{EntityId, NetworkedBody},
};

/// Samples owned bodies into snapshots. Holds no state between ticks.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotWriter {
    /// Avatars replicate orientation; the ball does not.
    pub include_rotation: bool,
}

impl SnapshotWriter {
    pub fn new(include_rotation: bool) -> Self {
        Self { include_rotation }
    }

    /// Reads the body's live state, stamped with the session time `sent_at`.
    pub fn sample<B: NetworkedBody + ?Sized>(
        &self,
        entity: EntityId,
        body: &B,
        sent_at: f64,
    ) -> Snapshot {
        let pose = body.pose();
        let mut snapshot = Snapshot::new(entity, sent_at, pose.position, body.velocity());
        if self.include_rotation {
            snapshot.rotation = Some(pose.rotation);
        }
        if let Some(anim) = body.animation() {
            snapshot.anim = anim.clone();
        }
        snapshot
    }
}

/// Decides on which physics ticks snapshots go out.
///
/// Spreads `snapshot_hz` sends evenly over `tick_hz` ticks using an integer
/// accumulator, so non-integer ratios do not drift.
#[derive(Debug, Clone)]
pub struct SendSchedule {
    tick_hz: u32,
    snapshot_hz: u32,
    acc: u32,
}

impl SendSchedule {
    pub fn new(tick_hz: u32, snapshot_hz: u32) -> Self {
        let tick_hz = tick_hz.max(1);
        Self {
            tick_hz,
            snapshot_hz: snapshot_hz.clamp(1, tick_hz),
            // Start primed so the first tick sends.
            acc: tick_hz,
        }
    }

    /// Call once per physics tick.
    pub fn due(&mut self) -> bool {
        if self.acc >= self.tick_hz {
            self.acc -= self.tick_hz;
            self.acc += self.snapshot_hz;
            true
        } else {
            self.acc += self.snapshot_hz;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        anim::AnimValue,
        math::{Quat, Vec3},
        world::{Body, BodyKind, RigidBody},
    };

    #[test]
    fn ball_sample_has_no_rotation() {
        let mut rigid = RigidBody::at(Vec3::new(1.0, 2.0, 3.0));
        rigid.velocity = Vec3::new(0.0, 0.0, -4.0);
        let ball = Body::new(BodyKind::Ball, None, rigid);

        let s = SnapshotWriter::new(false).sample(EntityId(0), &ball, 7.5);
        assert_eq!(s.entity, EntityId(0));
        assert_eq!(s.sent_at, 7.5);
        assert_eq!(s.position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(s.velocity, Vec3::new(0.0, 0.0, -4.0));
        assert!(s.rotation.is_none());
        assert!(s.anim.is_empty());
    }

    #[test]
    fn avatar_sample_carries_rotation_and_anim() {
        let mut avatar = Body::new(BodyKind::Avatar, None, RigidBody::default());
        avatar.rigid.pose.rotation = Quat::from_axis_angle(Vec3::Y, 0.5);
        avatar.anim.set("Grounded", AnimValue::Bool(true));

        let s = SnapshotWriter::new(true).sample(EntityId(4), &avatar, 1.0);
        assert_eq!(s.rotation, Some(avatar.rigid.pose.rotation));
        assert_eq!(s.anim.bool("Grounded"), Some(true));
    }

    #[test]
    fn schedule_spreads_sends() {
        let mut schedule = SendSchedule::new(50, 20);
        let sent = (0..50).filter(|_| schedule.due()).count();
        assert_eq!(sent, 20);
    }

    #[test]
    fn schedule_first_tick_sends() {
        let mut schedule = SendSchedule::new(50, 1);
        assert!(schedule.due());
        assert!(!schedule.due());
    }

    #[test]
    fn schedule_every_tick_when_rates_match() {
        let mut schedule = SendSchedule::new(30, 30);
        assert!((0..30).all(|_| schedule.due()));
    }
}
