mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
pub mod status;
pub mod store;

pub use availability::{BusinessHours, Projection};
pub use error::{EngineError, Entity};
pub use store::{BookingStore, Tables, Transaction};

use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;
use ulid::Ulid;

use crate::directory::{OptionCatalog, UserDirectory};
use crate::model::*;
use crate::notify::NotifyHub;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

/// Booking orchestrator: validates requests, resolves collaborators, and runs
/// every check-then-write sequence inside one store transaction.
pub struct Engine {
    pub(super) store: BookingStore,
    pub(super) users: Arc<dyn UserDirectory>,
    pub(super) catalog: Arc<dyn OptionCatalog>,
    pub(super) hours: BusinessHours,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    /// Replay the WAL and start the writer. Must run inside a tokio runtime.
    pub fn open(
        wal_path: &Path,
        users: Arc<dyn UserDirectory>,
        catalog: Arc<dyn OptionCatalog>,
        hours: BusinessHours,
    ) -> io::Result<Self> {
        let notify = Arc::new(NotifyHub::new());
        let store = BookingStore::open(wal_path, notify.clone())?;
        Ok(Self {
            store,
            users,
            catalog,
            hours,
            notify,
        })
    }

    pub fn store(&self) -> &BookingStore {
        &self.store
    }

    pub fn business_hours(&self) -> &BusinessHours {
        &self.hours
    }

    /// Committed changes of one booking.
    pub fn subscribe(&self, booking_id: Ulid) -> broadcast::Receiver<Change> {
        self.notify.subscribe(booking_id)
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Change> {
        self.notify.subscribe_all()
    }
}
