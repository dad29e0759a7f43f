use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{now_ms, Engine};
use crate::model::Ms;

/// Background task that cancels temporary bookings whose confirmation
/// deadline has passed.
pub async fn run_reaper(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        reap_once(&engine, now_ms()).await;
    }
}

/// One sweep. Returns how many bookings were cancelled.
pub async fn reap_once(engine: &Engine, now: Ms) -> usize {
    let mut cancelled = 0;
    for id in engine.collect_expired_temporary(now).await {
        match engine.auto_cancel_expired(id, now).await {
            Ok(Some(_)) => {
                info!("auto-cancelled booking {id}: confirmation deadline passed");
                cancelled += 1;
            }
            // Confirmed or cancelled since the scan.
            Ok(None) => debug!("reaper skip {id}: no longer expired"),
            Err(e) => warn!("reaper failed to cancel {id}: {e}"),
        }
    }
    cancelled
}

/// Background task that rewrites the WAL once enough commits accumulate,
/// then drops change-feed channels nobody listens on.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

/// Returns true if a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    engine.notify.prune();
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("WAL compacted after {appends} appends");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{InMemoryCatalog, InMemoryDirectory};
    use crate::engine::BusinessHours;
    use crate::model::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    const BASE: Ms = 1_748_822_400_000; // 2025-06-02T00:00Z

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("studio_book_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn engine(name: &str) -> Engine {
        Engine::open(
            &test_wal_path(name),
            Arc::new(InMemoryDirectory::new()),
            Arc::new(InMemoryCatalog::new()),
            BusinessHours::default(),
        )
        .unwrap()
    }

    fn temporary(start_h: i64, deadline: Ms, auto: bool) -> CreateBookingRequest {
        CreateBookingRequest {
            booking_type: BookingType::Temporary,
            confirmation_deadline: Some(deadline),
            automatic_cancellation: auto,
            ..CreateBookingRequest::new(BASE + start_h * HOUR_MS, BASE + (start_h + 1) * HOUR_MS)
        }
    }

    #[tokio::test]
    async fn reaper_cancels_expired_temporary_bookings() {
        let engine = engine("reap.wal");
        let staff = Actor::staff(Ulid::new());

        let expired = engine.create_booking(temporary(10, BASE, true), &staff).await.unwrap();
        let manual = engine.create_booking(temporary(12, BASE, false), &staff).await.unwrap();
        let later = engine
            .create_booking(temporary(14, BASE + 48 * HOUR_MS, true), &staff)
            .await
            .unwrap();

        let now = BASE + HOUR_MS;
        assert_eq!(engine.collect_expired_temporary(now).await, vec![expired.id]);
        assert_eq!(reap_once(&engine, now).await, 1);

        let reaped = engine.get_booking(expired.id).await.unwrap();
        assert_eq!(reaped.status, BookingStatus::Cancelled);
        let history = engine.status_history(expired.id).await.unwrap();
        let last = history.last().unwrap();
        assert_eq!(last.reason, "confirmation deadline passed");
        assert_eq!(last.changed_by, Actor::system().id);

        assert_eq!(engine.get_booking(manual.id).await.unwrap().status, BookingStatus::Pending);
        assert_eq!(engine.get_booking(later.id).await.unwrap().status, BookingStatus::Pending);

        // Second sweep finds nothing.
        assert_eq!(reap_once(&engine, now).await, 0);
    }

    #[tokio::test]
    async fn approved_booking_is_not_reaped() {
        let engine = engine("reap_approved.wal");
        let staff = Actor::staff(Ulid::new());
        let b = engine.create_booking(temporary(10, BASE, true), &staff).await.unwrap();
        engine
            .update_booking(
                b.id,
                UpdateBookingRequest {
                    status: Some(BookingStatus::Approved),
                    ..UpdateBookingRequest::default()
                },
                &staff,
            )
            .await
            .unwrap();
        assert_eq!(engine.auto_cancel_expired(b.id, BASE + HOUR_MS).await.unwrap(), None);
        assert_eq!(reap_once(&engine, BASE + HOUR_MS).await, 0);
    }

    #[tokio::test]
    async fn compactor_respects_threshold() {
        let engine = engine("compactor.wal");
        let staff = Actor::staff(Ulid::new());
        for h in 0..3 {
            engine
                .create_booking(CreateBookingRequest::new(BASE + h * HOUR_MS, BASE + (h + 1) * HOUR_MS), &staff)
                .await
                .unwrap();
        }
        assert!(!compact_if_needed(&engine, 10).await);
        assert!(compact_if_needed(&engine, 3).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
