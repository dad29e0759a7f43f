use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Change, Commit};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for committed changes: one studio-wide feed plus lazily
/// created per-booking channels.
pub struct NotifyHub {
    all: broadcast::Sender<Change>,
    channels: DashMap<Ulid, broadcast::Sender<Change>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            channels: DashMap::new(),
        }
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Change> {
        self.all.subscribe()
    }

    /// Subscribe to one booking's changes. Creates the channel if needed.
    pub fn subscribe(&self, booking_id: Ulid) -> broadcast::Receiver<Change> {
        self.channels
            .entry(booking_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Fan out a durable commit. No-op for channels nobody listens on.
    pub fn send(&self, commit: &Commit) {
        for change in &commit.changes {
            let _ = self.all.send(change.clone());
            if let Some(sender) = self.channels.get(&change.booking_id()) {
                let _ = sender.send(change.clone());
            }
        }
    }

    /// Drop a booking channel once its last receiver is gone.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;

    fn logged(booking_id: Ulid) -> Change {
        Change::StatusLogged(StatusLogEntry {
            id: Ulid::new(),
            booking_id,
            previous_status: Some(BookingStatus::Pending),
            new_status: BookingStatus::Approved,
            changed_by: Ulid::new(),
            changed_at: 0,
            reason: "approved".into(),
        })
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let watched = Ulid::new();
        let mut rx = hub.subscribe(watched);
        let mut all = hub.subscribe_all();

        let other = logged(Ulid::new());
        let mine = logged(watched);
        hub.send(&Commit {
            id: Ulid::new(),
            committed_at: 0,
            changes: vec![other.clone(), mine.clone()],
        });

        assert_eq!(rx.recv().await.unwrap(), mine);
        assert_eq!(all.recv().await.unwrap(), other);
        assert_eq!(all.recv().await.unwrap(), mine);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(&Commit {
            id: Ulid::new(),
            committed_at: 0,
            changes: vec![logged(Ulid::new())],
        });
    }

    #[tokio::test]
    async fn prune_drops_abandoned_channels() {
        let hub = NotifyHub::new();
        let rx = hub.subscribe(Ulid::new());
        let _kept = hub.subscribe(Ulid::new());
        drop(rx);
        hub.prune();
        assert_eq!(hub.channels.len(), 1);
    }
}
