//! Per-peer collection of synchronizers, one per networked body.

use std::collections::BTreeMap;

use tracing::trace;

use crate::{
    config::{GameConfig, SyncConfig},
    snapshot::Snapshot,
    world::{BodyKind, EntityId, PeerId, World},
};

use super::{Correction, SendSchedule, SnapshotWriter, Synchronizer};

#[derive(Debug)]
pub struct SyncRegistry {
    local: PeerId,
    ball: SyncConfig,
    avatar: SyncConfig,
    entries: BTreeMap<EntityId, Synchronizer>,
    schedule: SendSchedule,
}

impl SyncRegistry {
    pub fn new(local: PeerId, cfg: &GameConfig) -> Self {
        Self {
            local,
            ball: cfg.ball,
            avatar: cfg.avatar,
            entries: BTreeMap::new(),
            schedule: SendSchedule::new(cfg.tick_hz, cfg.snapshot_hz),
        }
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, entity: EntityId) -> Option<&Synchronizer> {
        self.entries.get(&entity)
    }

    /// Starts synchronizing a body. Replaces any previous synchronizer.
    pub fn track(&mut self, entity: EntityId, kind: BodyKind, owner: Option<PeerId>) {
        let (cfg, writer) = match kind {
            BodyKind::Ball => (self.ball, SnapshotWriter::new(false)),
            BodyKind::Avatar => (self.avatar, SnapshotWriter::new(true)),
        };
        self.entries.insert(
            entity,
            Synchronizer::new(entity, self.local, owner, cfg, writer),
        );
    }

    pub fn untrack(&mut self, entity: EntityId) -> bool {
        self.entries.remove(&entity).is_some()
    }

    pub fn set_owner(&mut self, entity: EntityId, owner: Option<PeerId>) -> bool {
        self.entries
            .get_mut(&entity)
            .map(|s| s.set_owner(owner))
            .unwrap_or(false)
    }

    pub fn reset(&mut self, entity: EntityId) {
        if let Some(s) = self.entries.get_mut(&entity) {
            s.reset();
        }
    }

    /// Routes an incoming snapshot to its synchronizer.
    pub fn deliver(&self, snapshot: Snapshot) -> bool {
        match self.entries.get(&snapshot.entity) {
            Some(s) => s.deliver(snapshot),
            None => {
                trace!(entity = ?snapshot.entity, "Snapshot for untracked entity");
                false
            }
        }
    }

    /// Runs the reader half for every tracked body present in `world`.
    pub fn advance(&mut self, world: &mut World, dt: f32, now: f64) -> Vec<(EntityId, Correction)> {
        let mut out = Vec::new();
        for (entity, sync) in self.entries.iter_mut() {
            if let Some(body) = world.get_mut(*entity) {
                let c = sync.advance(dt, now, body);
                if c != Correction::Idle {
                    out.push((*entity, c));
                }
            }
        }
        out
    }

    /// Runs the writer half. Returns snapshots for owned bodies on ticks when
    /// the send schedule is due, otherwise nothing. Call once per tick.
    pub fn collect_outbound(&mut self, world: &World, now: f64) -> Vec<Snapshot> {
        if !self.schedule.due() {
            return Vec::new();
        }
        self.entries
            .values()
            .filter_map(|s| world.get(s.entity()).and_then(|b| s.sample(b, now)))
            .collect()
    }
}
