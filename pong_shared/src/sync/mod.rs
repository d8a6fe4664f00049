//! Networked rigid-body state synchronization.
//!
//! One [`Synchronizer`] exists per networked body. Its writer half samples the
//! body while the local peer owns it; its reader half corrects the local copy
//! while someone else does. Ownership changes rebuild the reader from scratch.
//!
//! Everything here runs on the fixed physics tick. The only asynchronous input
//! is snapshot delivery, which goes through a latest-wins [`inbox`].

pub mod inbox;
pub mod reader;
pub mod registry;
pub mod writer;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    config::SyncConfig,
    snapshot::Snapshot,
    world::{EntityId, NetworkedBody, PeerId},
};

pub use inbox::{inbox, InboxReceiver, InboxSender};
pub use reader::{Correction, ReaderState, ReaderStats, Receipt, SnapshotReader, SyncState};
pub use registry::SyncRegistry;
pub use writer::{SendSchedule, SnapshotWriter};

/// Outbound replication channel.
///
/// Delivery may be lossy, duplicated or reordered; readers cope with all three.
#[async_trait]
pub trait SnapshotTransport: Send + Sync {
    async fn broadcast_snapshot(&self, snapshot: &Snapshot) -> anyhow::Result<()>;
}

/// Per-body synchronizer.
#[derive(Debug)]
pub struct Synchronizer {
    entity: EntityId,
    local: PeerId,
    owner: Option<PeerId>,
    cfg: SyncConfig,
    writer: SnapshotWriter,
    /// Present exactly while the body is not locally owned.
    reader: Option<SnapshotReader>,
    inbox_tx: InboxSender,
    inbox_rx: InboxReceiver,
}

impl Synchronizer {
    pub fn new(
        entity: EntityId,
        local: PeerId,
        owner: Option<PeerId>,
        cfg: SyncConfig,
        writer: SnapshotWriter,
    ) -> Self {
        let (inbox_tx, inbox_rx) = inbox();
        let reader = (owner != Some(local)).then(|| SnapshotReader::new(cfg));
        Self {
            entity,
            local,
            owner,
            cfg,
            writer,
            reader,
            inbox_tx,
            inbox_rx,
        }
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn owner(&self) -> Option<PeerId> {
        self.owner
    }

    /// True while the local peer is the body's authority.
    pub fn is_authority(&self) -> bool {
        self.owner == Some(self.local)
    }

    pub fn reader(&self) -> Option<&SnapshotReader> {
        self.reader.as_ref()
    }

    /// Handle for the network side to deliver snapshots into.
    pub fn sender(&self) -> InboxSender {
        self.inbox_tx.clone()
    }

    /// Applies an ownership change. Any change discards reader state.
    /// Returns whether the owner actually changed.
    pub fn set_owner(&mut self, owner: Option<PeerId>) -> bool {
        if owner == self.owner {
            return false;
        }
        info!(entity = ?self.entity, from = ?self.owner, to = ?owner, "Ownership changed");
        self.owner = owner;
        self.rebuild_reader();
        true
    }

    /// Discards reader state, e.g. after a respawn. The next snapshot is
    /// treated as the first.
    pub fn reset(&mut self) {
        debug!(entity = ?self.entity, "Synchronizer reset");
        self.rebuild_reader();
    }

    fn rebuild_reader(&mut self) {
        self.reader = (!self.is_authority()).then(|| SnapshotReader::new(self.cfg));
        // Forget the previous owner's send time along with any pending snapshot.
        self.inbox_tx.clear();
        let _ = self.inbox_rx.take();
    }

    /// Delivers a snapshot from the network. Snapshots for a locally owned
    /// body are ignored.
    pub fn deliver(&self, snapshot: Snapshot) -> bool {
        if self.is_authority() {
            return false;
        }
        self.inbox_tx.offer(snapshot)
    }

    /// Writer half: samples the body if the local peer owns it.
    pub fn sample<B: NetworkedBody + ?Sized>(&self, body: &B, now: f64) -> Option<Snapshot> {
        self.is_authority()
            .then(|| self.writer.sample(self.entity, body, now))
    }

    /// Reader half: consumes the newest delivered snapshot, then runs one
    /// tick of correction. `now` is the session time, `dt` the physics step.
    pub fn advance<B: NetworkedBody + ?Sized>(
        &mut self,
        dt: f32,
        now: f64,
        body: &mut B,
    ) -> Correction {
        let Some(reader) = self.reader.as_mut() else {
            return Correction::Idle;
        };
        if let Some(snapshot) = self.inbox_rx.take() {
            reader.receive(&snapshot, now, body);
        }
        reader.advance(dt, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        math::Vec3,
        world::{Body, BodyKind, RigidBody},
    };

    const ME: PeerId = PeerId(1);
    const THEM: PeerId = PeerId(2);

    fn ball_sync(owner: Option<PeerId>) -> Synchronizer {
        Synchronizer::new(EntityId(0), ME, owner, SyncConfig::ball(), SnapshotWriter::new(false))
    }

    fn ball() -> Body {
        Body::new(BodyKind::Ball, None, RigidBody::default())
    }

    #[test]
    fn owner_samples_and_does_not_read() {
        let mut sync = ball_sync(Some(ME));
        let mut body = ball();
        assert!(sync.is_authority());
        assert!(sync.reader().is_none());
        assert!(sync.sample(&body, 1.0).is_some());
        assert!(!sync.deliver(Snapshot::new(EntityId(0), 1.0, Vec3::Y, Vec3::ZERO)));
        assert_eq!(sync.advance(0.02, 1.0, &mut body), Correction::Idle);
    }

    #[test]
    fn non_owner_reads_and_does_not_sample() {
        let mut sync = ball_sync(Some(THEM));
        let mut body = ball();
        assert!(sync.sample(&body, 1.0).is_none());

        assert!(sync.deliver(Snapshot::new(EntityId(0), 1.0, Vec3::Y, Vec3::ZERO)));
        sync.advance(0.02, 1.0, &mut body);
        assert!(sync.reader().unwrap().has_received_first());
        assert_eq!(body.position(), Vec3::Y);
    }

    #[test]
    fn only_newest_delivery_is_consumed() {
        let mut sync = ball_sync(Some(THEM));
        let mut body = ball();
        sync.deliver(Snapshot::new(EntityId(0), 2.0, Vec3::new(2.0, 0.0, 0.0), Vec3::ZERO));
        sync.deliver(Snapshot::new(EntityId(0), 1.0, Vec3::new(1.0, 0.0, 0.0), Vec3::ZERO));
        sync.advance(0.02, 2.0, &mut body);
        let state = sync.reader().unwrap().sync_state().unwrap();
        assert_eq!(state.sent_at, 2.0);
        assert_eq!(state.target_position, Vec3::new(2.0, 0.0, 0.0));
    }

    #[test]
    fn ownership_transfer_resets_reader() {
        let mut sync = ball_sync(Some(THEM));
        let mut body = ball();
        sync.deliver(Snapshot::new(EntityId(0), 1.0, Vec3::Y, Vec3::ZERO));
        sync.advance(0.02, 1.0, &mut body);

        assert!(sync.set_owner(Some(ME)));
        assert!(sync.is_authority());
        assert!(sync.reader().is_none());

        assert!(sync.set_owner(Some(THEM)));
        assert_eq!(sync.reader().unwrap().state(), &ReaderState::Uninitialized);
        assert!(!sync.set_owner(Some(THEM)));
    }

    #[test]
    fn reset_discards_pending_delivery() {
        let mut sync = ball_sync(Some(THEM));
        let mut body = ball();
        sync.deliver(Snapshot::new(EntityId(0), 1.0, Vec3::Y, Vec3::ZERO));
        sync.reset();
        assert_eq!(sync.advance(0.02, 1.0, &mut body), Correction::Idle);
        assert_eq!(body.position(), Vec3::ZERO);
    }

    #[test]
    fn new_owner_with_earlier_send_times_is_accepted() {
        let mut sync = ball_sync(Some(THEM));
        let mut body = ball();
        assert!(sync.deliver(Snapshot::new(EntityId(0), 5.0, Vec3::Y, Vec3::ZERO)));
        sync.advance(0.02, 5.0, &mut body);

        assert!(sync.set_owner(Some(PeerId(3))));
        let moved = Vec3::new(0.5, 1.0, -0.5);
        assert!(sync.deliver(Snapshot::new(EntityId(0), 4.99, moved, Vec3::ZERO)));
        assert_ne!(sync.advance(0.02, 5.02, &mut body), Correction::Idle);
        assert!(sync.reader().unwrap().has_received_first());
        assert_eq!(body.position(), moved);
    }
}
