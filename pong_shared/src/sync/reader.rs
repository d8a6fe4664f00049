//! Remote-side correction.
//!
//! A reader holds the newest accepted snapshot for a body it does not own and,
//! once per physics tick, nudges the local copy toward where that snapshot
//! says the body should be by now:
//!
//! ```text
//! predicted = target_position + target_velocity * elapsed * delay_compensation
//! ```
//!
//! Small errors are blended away at a rate that grows with distance. Errors
//! beyond the teleport threshold are resolved by snapping to the snapshot.

use tracing::{debug, trace};

use crate::{
    config::SyncConfig,
    math::{clamp01, Quat, Vec3},
    snapshot::Snapshot,
    world::{NetworkedBody, Pose},
};

/// Target state taken from the newest accepted snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncState {
    pub target_position: Vec3,
    pub target_velocity: Vec3,
    pub target_rotation: Option<Quat>,
    /// Send time of the snapshot the targets came from.
    pub sent_at: f64,
    /// Seconds of physics time since that snapshot was accepted.
    pub elapsed_since_snapshot: f32,
}

/// Reader lifecycle.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ReaderState {
    /// Nothing received yet. The body is left as spawned.
    #[default]
    Uninitialized,
    Tracking(SyncState),
}

/// Outcome of offering a snapshot to a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// First snapshot; the body was placed on it.
    First,
    Accepted,
    /// Older than the held snapshot and discarded.
    Stale,
}

/// What one tick did to the body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Correction {
    /// No snapshot yet, or the body is locally owned.
    Idle,
    /// Within the dead zone; left untouched.
    Held { distance: f32 },
    Blended { distance: f32, factor: f32 },
    /// Snapped to the snapshot position and velocity.
    Teleported { distance: f32 },
}

/// Running totals, mainly for status output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub accepted: u64,
    pub stale: u64,
    pub teleports: u64,
}

#[derive(Debug, Clone)]
pub struct SnapshotReader {
    cfg: SyncConfig,
    state: ReaderState,
    stats: ReaderStats,
}

impl SnapshotReader {
    pub fn new(cfg: SyncConfig) -> Self {
        Self {
            cfg,
            state: ReaderState::Uninitialized,
            stats: ReaderStats::default(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.cfg
    }

    pub fn state(&self) -> &ReaderState {
        &self.state
    }

    pub fn stats(&self) -> ReaderStats {
        self.stats
    }

    pub fn sync_state(&self) -> Option<&SyncState> {
        match &self.state {
            ReaderState::Tracking(s) => Some(s),
            ReaderState::Uninitialized => None,
        }
    }

    pub fn has_received_first(&self) -> bool {
        matches!(self.state, ReaderState::Tracking(_))
    }

    /// Forgets all snapshot state, e.g. after a respawn.
    pub fn reset(&mut self) {
        self.state = ReaderState::Uninitialized;
    }

    /// Where the body is expected to be right now, if anything was received.
    pub fn predicted_target(&self) -> Option<Vec3> {
        self.sync_state().map(|s| self.predict(s))
    }

    fn predict(&self, s: &SyncState) -> Vec3 {
        let horizon = self.cfg.extrapolation_limit.apply(s.elapsed_since_snapshot);
        s.target_position + s.target_velocity * (horizon * self.cfg.delay_compensation)
    }

    /// Offers a snapshot. `now` is the local reading of the session clock.
    pub fn receive<B: NetworkedBody + ?Sized>(
        &mut self,
        snapshot: &Snapshot,
        now: f64,
        body: &mut B,
    ) -> Receipt {
        if let ReaderState::Tracking(held) = &self.state {
            if snapshot.sent_at < held.sent_at {
                self.stats.stale += 1;
                trace!(
                    entity = ?snapshot.entity,
                    sent_at = snapshot.sent_at,
                    held = held.sent_at,
                    "Discarding stale snapshot"
                );
                return Receipt::Stale;
            }
        }

        let mut target_position = snapshot.position;
        if self.cfg.project_transit_lag {
            target_position += snapshot.velocity * snapshot.transit_lag(now);
        }

        let first = !self.has_received_first();
        self.state = ReaderState::Tracking(SyncState {
            target_position,
            target_velocity: snapshot.velocity,
            target_rotation: snapshot.rotation,
            sent_at: snapshot.sent_at,
            elapsed_since_snapshot: 0.0,
        });
        self.stats.accepted += 1;

        if !snapshot.anim.is_empty() {
            body.set_animation(&snapshot.anim);
        }

        if first {
            let rotation = snapshot.rotation.unwrap_or(body.pose().rotation);
            body.set_pose(Pose {
                position: snapshot.position,
                rotation,
            });
            body.set_velocity(snapshot.velocity);
            debug!(entity = ?snapshot.entity, "First snapshot, placing body");
            Receipt::First
        } else {
            Receipt::Accepted
        }
    }

    /// Runs one physics tick of correction.
    pub fn advance<B: NetworkedBody + ?Sized>(&mut self, dt: f32, body: &mut B) -> Correction {
        let ReaderState::Tracking(s) = &mut self.state else {
            return Correction::Idle;
        };
        s.elapsed_since_snapshot += dt;
        let s = s.clone();

        let predicted = self.predict(&s);
        let current = body.pose();
        let distance = current.position.distance(predicted);

        if distance > self.cfg.teleport_threshold {
            body.set_pose(Pose {
                position: s.target_position,
                rotation: s.target_rotation.unwrap_or(current.rotation),
            });
            body.set_velocity(s.target_velocity);
            self.stats.teleports += 1;
            debug!(distance, threshold = self.cfg.teleport_threshold, "Teleporting body");
            return Correction::Teleported { distance };
        }

        if self.cfg.dead_zone > 0.0 && distance <= self.cfg.dead_zone {
            return Correction::Held { distance };
        }

        let factor =
            clamp01(dt * (self.cfg.base_blend_rate + distance * self.cfg.distance_blend_gain));
        let rotation = match s.target_rotation {
            Some(target) => current
                .rotation
                .slerp(target, clamp01(dt * self.cfg.rotation_smoothing)),
            None => current.rotation,
        };
        body.set_pose(Pose {
            position: current.position.lerp(predicted, factor),
            rotation,
        });

        let min_speed = self.cfg.velocity_blend_min_speed;
        if min_speed <= 0.0 || s.target_velocity.len() > min_speed {
            let velocity = body
                .velocity()
                .lerp(s.target_velocity, clamp01(dt * self.cfg.velocity_smoothing));
            body.set_velocity(velocity);
        }

        Correction::Blended { distance, factor }
    }
}
