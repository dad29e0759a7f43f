use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use super::error::Entity;
use super::{now_ms, EngineError};

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// While every `Transaction` holds the studio-wide write lock until its
/// append is acknowledged, at most one Append is queued and batches have
/// size one.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { commit, response } => {
                let mut batch = vec![(commit, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { commit, response }) => batch.push((commit, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }
                flush_and_respond(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Commit, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Commit, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (commit, _) in batch {
        if let Err(e) = wal.append_buffered(commit) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error: buffered bytes of a failed batch must not
    // reach the next one.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { snapshot, response } => {
            let result = Wal::write_compact_file(wal.path(), &snapshot)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, commit: &Commit) -> Result<(), EngineError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            commit: commit.clone(),
            response: tx,
        })
        .await
        .map_err(|_| EngineError::StorageFailure("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::StorageFailure("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::StorageFailure(e.to_string()))
}

// ── Tables ───────────────────────────────────────────────

/// Entry of the active-interval index.
#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    id: Ulid,
    span: Span,
}

/// In-memory state rebuilt from the WAL: bookings (with line items), the
/// active-interval index, the status log and idempotency keys.
#[derive(Debug, Default)]
pub struct Tables {
    bookings: HashMap<Ulid, Booking>,
    /// Pending/approved bookings only, sorted by `span.start`.
    active: Vec<IndexEntry>,
    status_log: Vec<StatusLogEntry>,
    idempotency: HashMap<String, Ulid>,
}

/// Inverse of one applied change.
#[derive(Debug)]
enum Undo {
    Restore(Box<Booking>),
    Remove(Ulid),
    PopLog,
}

impl Tables {
    pub fn get(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.get(id)
    }

    pub fn len(&self) -> usize {
        self.bookings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
    }

    pub fn bookings(&self) -> impl Iterator<Item = &Booking> {
        self.bookings.values()
    }

    pub fn by_idempotency_key(&self, key: &str) -> Option<&Booking> {
        self.idempotency.get(key).and_then(|id| self.bookings.get(id))
    }

    /// Active bookings overlapping `query`, ordered by start, minus `exclude`.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn active_overlapping(&self, query: Span, exclude: Option<Ulid>) -> impl Iterator<Item = &Booking> {
        let right_bound = self.active.partition_point(|e| e.span.start < query.end);
        self.active[..right_bound]
            .iter()
            .filter(move |e| e.span.end > query.start && Some(e.id) != exclude)
            .filter_map(|e| self.bookings.get(&e.id))
    }

    pub fn status_log(&self) -> &[StatusLogEntry] {
        &self.status_log
    }

    pub fn history(&self, booking_id: &Ulid) -> Vec<StatusLogEntry> {
        self.status_log
            .iter()
            .filter(|e| e.booking_id == *booking_id)
            .cloned()
            .collect()
    }

    fn apply(&mut self, change: &Change) -> Undo {
        match change {
            Change::BookingPut(booking) => match self.put(booking.clone()) {
                Some(previous) => Undo::Restore(Box::new(previous)),
                None => Undo::Remove(booking.id),
            },
            Change::StatusLogged(entry) => {
                self.status_log.push(entry.clone());
                Undo::PopLog
            }
        }
    }

    fn revert(&mut self, undo: Undo) {
        match undo {
            Undo::Restore(previous) => {
                self.put(*previous);
            }
            Undo::Remove(id) => self.remove(&id),
            Undo::PopLog => {
                self.status_log.pop();
            }
        }
    }

    fn put(&mut self, booking: Booking) -> Option<Booking> {
        self.unindex(&booking.id);
        if booking.status.is_active() {
            let pos = self
                .active
                .partition_point(|e| e.span.start <= booking.span.start);
            self.active.insert(pos, IndexEntry { id: booking.id, span: booking.span });
        }
        if let Some(key) = &booking.idempotency_key {
            self.idempotency.insert(key.clone(), booking.id);
        }
        self.bookings.insert(booking.id, booking)
    }

    fn remove(&mut self, id: &Ulid) {
        self.unindex(id);
        if let Some(booking) = self.bookings.remove(id)
            && let Some(key) = booking.idempotency_key {
                self.idempotency.remove(&key);
            }
    }

    fn unindex(&mut self, id: &Ulid) {
        if let Some(pos) = self.active.iter().position(|e| e.id == *id) {
            self.active.remove(pos);
        }
    }

    /// Minimal change list that recreates the current state.
    fn snapshot(&self) -> Vec<Change> {
        let mut bookings: Vec<&Booking> = self.bookings.values().collect();
        bookings.sort_by_key(|b| b.id);
        bookings
            .into_iter()
            .map(|b| Change::BookingPut(b.clone()))
            .chain(self.status_log.iter().cloned().map(Change::StatusLogged))
            .collect()
    }
}

fn rollback(tables: &mut Tables, undo: Vec<Undo>) {
    for u in undo.into_iter().rev() {
        tables.revert(u);
    }
}

// ── Store ────────────────────────────────────────────────

/// Durable booking store. All writes go through a [`Transaction`], which holds
/// the studio-wide write lock from its first read until commit or drop.
#[derive(Clone)]
pub struct BookingStore {
    tables: Arc<RwLock<Tables>>,
    wal_tx: mpsc::Sender<WalCommand>,
    notify: Arc<NotifyHub>,
}

impl BookingStore {
    /// Replay the WAL at `wal_path`, cut any torn tail, and start the
    /// group-commit writer. Must be called from within a tokio runtime.
    pub fn open(wal_path: &Path, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let commits = Wal::recover(wal_path)?;
        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut tables = Tables::default();
        for commit in &commits {
            for change in &commit.changes {
                tables.apply(change);
            }
        }
        info!(
            "booking store opened: {} commits replayed, {} bookings, {} status log rows",
            commits.len(),
            tables.len(),
            tables.status_log.len()
        );

        Ok(Self {
            tables: Arc::new(RwLock::new(tables)),
            wal_tx,
            notify,
        })
    }

    /// Start a write transaction. Waits for any other writer to finish.
    pub async fn begin(&self) -> Transaction {
        let guard = self.tables.clone().write_owned().await;
        Transaction {
            guard: Some(guard),
            changes: Vec::new(),
            undo: Vec::new(),
            wal_tx: self.wal_tx.clone(),
            notify: self.notify.clone(),
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().await
    }

    pub async fn get(&self, id: &Ulid) -> Result<Booking, EngineError> {
        self.read()
            .await
            .get(id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Booking, *id))
    }

    pub async fn list_active_overlapping(&self, span: &Span, exclude: Option<Ulid>) -> Vec<Booking> {
        self.read()
            .await
            .active_overlapping(*span, exclude)
            .cloned()
            .collect()
    }

    /// Rewrite the WAL as one snapshot commit. Writers are blocked for the
    /// duration so no commit can fall between snapshot and swap.
    pub async fn compact(&self) -> Result<(), EngineError> {
        let guard = self.tables.read().await;
        let snapshot = Commit {
            id: Ulid::new(),
            committed_at: now_ms(),
            changes: guard.snapshot(),
        };
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { snapshot, response: tx })
            .await
            .map_err(|_| EngineError::StorageFailure("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::StorageFailure("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageFailure(e.to_string()));
        drop(guard);
        result
    }

    /// Same tables, but every commit fails as if the WAL writer had died.
    #[cfg(test)]
    pub(crate) fn with_dead_writer(&self) -> Self {
        let (wal_tx, _) = mpsc::channel(1);
        Self {
            tables: self.tables.clone(),
            wal_tx,
            notify: self.notify.clone(),
        }
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

// ── Transaction ──────────────────────────────────────────

/// Scoped write transaction.
///
/// Staged changes are applied to the tables immediately (so later reads in
/// the same transaction see them) together with an undo record. Nothing is
/// visible to other tasks until commit releases the lock. Dropping an
/// uncommitted transaction reverts every staged change.
pub struct Transaction {
    guard: Option<OwnedRwLockWriteGuard<Tables>>,
    changes: Vec<Change>,
    undo: Vec<Undo>,
    wal_tx: mpsc::Sender<WalCommand>,
    notify: Arc<NotifyHub>,
}

impl Transaction {
    pub fn tables(&self) -> &Tables {
        self.guard.as_deref().expect("transaction already finished")
    }

    fn stage(&mut self, change: Change) {
        let tables = self.guard.as_deref_mut().expect("transaction already finished");
        let undo = tables.apply(&change);
        self.undo.push(undo);
        self.changes.push(change);
    }

    pub fn get(&self, id: &Ulid) -> Result<&Booking, EngineError> {
        self.tables()
            .get(id)
            .ok_or(EngineError::NotFound(Entity::Booking, *id))
    }

    pub fn list_active_overlapping(&self, span: &Span, exclude: Option<Ulid>) -> Vec<&Booking> {
        self.tables().active_overlapping(*span, exclude).collect()
    }

    /// Insert a new booking with its line items; the total is derived from
    /// the items' captured prices.
    pub fn create(&mut self, mut booking: Booking, options: Vec<LineItem>) -> Result<Booking, EngineError> {
        if self.tables().get(&booking.id).is_some() {
            return Err(EngineError::ConstraintViolation(format!(
                "booking {} already exists",
                booking.id
            )));
        }
        if let Some(key) = &booking.idempotency_key
            && self.tables().by_idempotency_key(key).is_some() {
                return Err(EngineError::ConstraintViolation(format!(
                    "idempotency key {key:?} already used"
                )));
            }
        booking.total_amount = line_items_total(&options);
        booking.options = options;
        self.stage(Change::BookingPut(booking.clone()));
        Ok(booking)
    }

    pub fn update(&mut self, id: &Ulid, patch: &FieldPatch) -> Result<Booking, EngineError> {
        let mut booking = self.get(id)?.clone();
        if let Some(span) = patch.span {
            booking.span = span;
        }
        if let Some(status) = patch.status {
            booking.status = status;
        }
        if let Some(booking_type) = patch.booking_type {
            booking.booking_type = booking_type;
        }
        if let Some(deadline) = patch.confirmation_deadline {
            booking.confirmation_deadline = deadline;
        }
        if let Some(auto) = patch.automatic_cancellation {
            booking.automatic_cancellation = auto;
        }
        if let Some(purpose) = &patch.purpose {
            booking.purpose = purpose.clone();
        }
        if let Some(notes) = &patch.notes {
            booking.notes = notes.clone();
        }
        if patch.updated_by.is_some() {
            booking.updated_by = patch.updated_by;
        }
        booking.updated_at = booking.updated_at.max(patch.updated_at);
        self.stage(Change::BookingPut(booking.clone()));
        Ok(booking)
    }

    /// Delete-then-insert of the whole line-item set.
    pub fn replace_line_items(&mut self, id: &Ulid, items: Vec<LineItem>) -> Result<Booking, EngineError> {
        let mut booking = self.get(id)?.clone();
        booking.total_amount = line_items_total(&items);
        booking.options = items;
        self.stage(Change::BookingPut(booking.clone()));
        Ok(booking)
    }

    pub fn append_status_log(&mut self, entry: StatusLogEntry) -> Result<(), EngineError> {
        if self.tables().get(&entry.booking_id).is_none() {
            return Err(EngineError::ConstraintViolation(format!(
                "status log references unknown booking {}",
                entry.booking_id
            )));
        }
        self.stage(Change::StatusLogged(entry));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Write all staged changes as one WAL entry, then release the lock.
    ///
    /// The append runs on its own task: once started it finishes (durable, or
    /// reverted on failure) even if the caller's future is dropped.
    pub async fn commit(mut self) -> Result<(), EngineError> {
        if self.changes.is_empty() {
            return Ok(());
        }
        let Some(mut guard) = self.guard.take() else {
            return Err(EngineError::StorageFailure("transaction already finished".into()));
        };
        let undo = std::mem::take(&mut self.undo);
        let commit = Commit {
            id: Ulid::new(),
            committed_at: now_ms(),
            changes: std::mem::take(&mut self.changes),
        };
        let wal_tx = self.wal_tx.clone();
        let notify = self.notify.clone();

        let task = tokio::spawn(async move {
            match wal_append(&wal_tx, &commit).await {
                Ok(()) => {
                    debug!("commit {} durable ({} changes)", commit.id, commit.changes.len());
                    notify.send(&commit);
                    Ok(())
                }
                Err(e) => {
                    warn!("commit {} failed, rolling back: {e}", commit.id);
                    rollback(&mut guard, undo);
                    Err(e)
                }
            }
        });
        task.await
            .map_err(|e| EngineError::StorageFailure(format!("commit task failed: {e}")))?
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.as_deref_mut()
            && !self.undo.is_empty() {
                debug!("rolling back {} uncommitted changes", self.undo.len());
                rollback(guard, std::mem::take(&mut self.undo));
            }
    }
}
