//! Latest-wins snapshot handoff.
//!
//! The network side offers snapshots as they arrive; the tick side takes at
//! most one per tick. Nothing queues: an unconsumed snapshot is replaced by
//! any newer one, and offers older than the held snapshot are dropped.

use tokio::sync::watch;

use crate::snapshot::Snapshot;

/// Creates a connected sender/receiver pair.
pub fn inbox() -> (InboxSender, InboxReceiver) {
    let (tx, rx) = watch::channel(None);
    (InboxSender { tx }, InboxReceiver { rx })
}

/// Producer half. Cheap to clone; every clone feeds the same slot.
#[derive(Debug, Clone)]
pub struct InboxSender {
    tx: watch::Sender<Option<Snapshot>>,
}

impl InboxSender {
    /// Stores `snapshot` unless the slot already holds a newer one.
    /// Returns whether the slot changed.
    pub fn offer(&self, snapshot: Snapshot) -> bool {
        self.tx.send_if_modified(|slot| match slot {
            Some(held) if snapshot.is_older_than(held) => false,
            _ => {
                *slot = Some(snapshot);
                true
            }
        })
    }

    /// Empties the slot, so the next offer is accepted whatever its send time.
    pub fn clear(&self) {
        self.tx.send_replace(None);
    }
}

/// Consumer half.
#[derive(Debug)]
pub struct InboxReceiver {
    rx: watch::Receiver<Option<Snapshot>>,
}

impl InboxReceiver {
    /// Takes the newest snapshot not yet seen by this receiver.
    pub fn take(&mut self) -> Option<Snapshot> {
        // Still yields the last offer after the sender is gone.
        let slot = self.rx.borrow_and_update();
        if slot.has_changed() {
            (*slot).clone()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{math::Vec3, world::EntityId};

    fn snap(sent_at: f64) -> Snapshot {
        Snapshot::new(EntityId(0), sent_at, Vec3::new(sent_at as f32, 0.0, 0.0), Vec3::ZERO)
    }

    #[test]
    fn empty_inbox_yields_nothing() {
        let (_tx, mut rx) = inbox();
        assert!(rx.take().is_none());
    }

    #[test]
    fn newer_overwrites_unconsumed() {
        let (tx, mut rx) = inbox();
        assert!(tx.offer(snap(1.0)));
        assert!(tx.offer(snap(2.0)));
        assert_eq!(rx.take().unwrap().sent_at, 2.0);
        assert!(rx.take().is_none());
    }

    #[test]
    fn older_offer_is_dropped() {
        let (tx, mut rx) = inbox();
        tx.offer(snap(2.0));
        assert!(!tx.offer(snap(1.0)));
        assert_eq!(rx.take().unwrap().sent_at, 2.0);
    }

    #[test]
    fn consumed_slot_still_rejects_older() {
        let (tx, mut rx) = inbox();
        tx.offer(snap(3.0));
        rx.take();
        assert!(!tx.offer(snap(2.5)));
        assert!(rx.take().is_none());
        assert!(tx.offer(snap(3.5)));
        assert_eq!(rx.take().unwrap().sent_at, 3.5);
    }

    #[test]
    fn cleared_slot_accepts_any_send_time() {
        let (tx, mut rx) = inbox();
        tx.offer(snap(5.0));
        tx.clear();
        assert!(rx.take().is_none());
        assert!(tx.offer(snap(1.0)));
        assert_eq!(rx.take().unwrap().sent_at, 1.0);
    }

    #[tokio::test]
    async fn handoff_across_tasks() {
        let (tx, mut rx) = inbox();
        let producer = tokio::spawn(async move {
            for i in 1..=10 {
                tx.offer(snap(i as f64));
                tokio::task::yield_now().await;
            }
        });
        producer.await.unwrap();
        assert_eq!(rx.take().unwrap().sent_at, 10.0);
    }
}
