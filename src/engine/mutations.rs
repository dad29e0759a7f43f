use std::time::Instant;

use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, is_available, validate_span};
use super::error::Entity;
use super::status;
use super::{now_ms, Engine, EngineError};

fn validate_text(field: &str, value: Option<&str>, max: usize) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max => Err(EngineError::Validation(format!(
            "{field} exceeds {max} bytes"
        ))),
        _ => Ok(()),
    }
}

fn validate_selections(selections: &[OptionSelection]) -> Result<(), EngineError> {
    if selections.len() > MAX_LINE_ITEMS {
        return Err(EngineError::Validation(format!(
            "at most {MAX_LINE_ITEMS} options per booking"
        )));
    }
    for sel in selections {
        if sel.quantity == 0 || sel.quantity > MAX_LINE_ITEM_QUANTITY {
            return Err(EngineError::Validation(format!(
                "quantity for option {} must be between 1 and {MAX_LINE_ITEM_QUANTITY}",
                sel.option_id
            )));
        }
    }
    Ok(())
}

/// A deadline only makes sense on a temporary booking.
fn validate_deadline(booking_type: BookingType, deadline: Option<Ms>) -> Result<(), EngineError> {
    let Some(deadline) = deadline else { return Ok(()) };
    if booking_type != BookingType::Temporary {
        return Err(EngineError::Validation(
            "confirmation deadline requires a temporary booking".into(),
        ));
    }
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&deadline) {
        return Err(EngineError::Validation("confirmation deadline out of range".into()));
    }
    Ok(())
}

impl Engine {
    pub async fn create_booking(&self, req: CreateBookingRequest, actor: &Actor) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.create_booking_inner(req, actor).await;
        observability::record_outcome("create", started, &result);
        result
    }

    async fn create_booking_inner(&self, req: CreateBookingRequest, actor: &Actor) -> Result<Booking, EngineError> {
        let span = Span::try_new(req.start, req.end)?;
        validate_span(&span)?;
        validate_text("purpose", req.purpose.as_deref(), MAX_TEXT_LEN)?;
        validate_text("notes", req.notes.as_deref(), MAX_TEXT_LEN)?;
        validate_text("idempotency key", req.idempotency_key.as_deref(), MAX_IDEMPOTENCY_KEY_LEN)?;
        validate_deadline(req.booking_type, req.confirmation_deadline)?;
        validate_selections(&req.options)?;

        // Fast path for retries: skip the collaborator round trips.
        if let Some(key) = &req.idempotency_key
            && let Some(existing) = self.store.read().await.by_idempotency_key(key) {
                debug!("idempotent replay of booking {} (key {key:?})", existing.id);
                return Ok(existing.clone());
            }

        let user_id = match req.user_id {
            Some(id) => Some(id),
            None if actor.elevated => None,
            None => Some(actor.id),
        };
        if let Some(id) = user_id
            && !self.users.user_exists(id).await {
                return Err(EngineError::NotFound(Entity::User, id));
            }
        let items = self.price_options(&req.options).await?;
        let initial = status::initial(req.status, actor)?;

        let mut txn = self.store.begin().await;
        // Re-checked under the lock: a concurrent retry may have won.
        if let Some(key) = &req.idempotency_key
            && let Some(existing) = txn.tables().by_idempotency_key(key) {
                debug!("idempotent replay of booking {} (key {key:?})", existing.id);
                return Ok(existing.clone());
            }
        check_no_conflict(txn.tables(), &span, None)?;

        let now = now_ms();
        let staff = actor.elevated.then_some(actor.id);
        let booking = txn.create(
            Booking {
                id: Ulid::new(),
                user_id,
                span,
                status: initial.to,
                booking_type: req.booking_type,
                confirmation_deadline: req.confirmation_deadline,
                automatic_cancellation: req.automatic_cancellation,
                purpose: req.purpose,
                notes: req.notes,
                options: Vec::new(),
                total_amount: 0,
                created_by: staff,
                updated_by: staff,
                created_at: now,
                updated_at: now,
                idempotency_key: req.idempotency_key,
            },
            items,
        )?;
        let reason = if actor.elevated { "created by staff" } else { "created" };
        txn.append_status_log(initial.log_entry(booking.id, actor, now, reason))?;
        txn.commit().await?;

        info!(
            "booking {} created: [{}, {}) {} total={}",
            booking.id, booking.span.start, booking.span.end, booking.status, booking.total_amount
        );
        Ok(booking)
    }

    pub async fn update_booking(
        &self,
        id: Ulid,
        req: UpdateBookingRequest,
        actor: &Actor,
    ) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.update_booking_inner(id, req, actor).await;
        observability::record_outcome("update", started, &result);
        result
    }

    async fn update_booking_inner(
        &self,
        id: Ulid,
        req: UpdateBookingRequest,
        actor: &Actor,
    ) -> Result<Booking, EngineError> {
        validate_text("purpose", req.purpose.as_ref().and_then(|p| p.as_deref()), MAX_TEXT_LEN)?;
        validate_text("notes", req.notes.as_ref().and_then(|n| n.as_deref()), MAX_TEXT_LEN)?;
        validate_text("reason", req.reason.as_deref(), MAX_REASON_LEN)?;
        let items = match &req.options {
            Some(selections) => {
                validate_selections(selections)?;
                Some(self.price_options(selections).await?)
            }
            None => None,
        };

        let mut txn = self.store.begin().await;
        let current = txn.get(&id)?.clone();

        let span = Span::try_new(
            req.start.unwrap_or(current.span.start),
            req.end.unwrap_or(current.span.end),
        )?;
        let span_changed = span != current.span;
        if span_changed {
            validate_span(&span)?;
        }

        let booking_type = req.booking_type.unwrap_or(current.booking_type);
        validate_deadline(booking_type, req.confirmation_deadline)?;
        let confirmation_deadline = match (booking_type, req.confirmation_deadline) {
            (BookingType::Confirmed, _) if current.confirmation_deadline.is_some() => Some(None),
            (_, Some(deadline)) => Some(Some(deadline)),
            _ => None,
        };

        let target = req.status.unwrap_or(current.status);
        let transition = status::transition(current.status, target)?;
        if span_changed && target.is_active() {
            check_no_conflict(txn.tables(), &span, Some(id))?;
        }

        let now = now_ms();
        let patch = FieldPatch {
            span: span_changed.then_some(span),
            status: transition.map(|t| t.to),
            booking_type: req.booking_type,
            confirmation_deadline,
            automatic_cancellation: req.automatic_cancellation,
            purpose: req.purpose,
            notes: req.notes,
            updated_by: actor.elevated.then_some(actor.id),
            updated_at: now,
        };
        let mut booking = txn.update(&id, &patch)?;
        if let Some(items) = items {
            booking = txn.replace_line_items(&id, items)?;
        }
        if let Some(t) = transition {
            let reason = req.reason.unwrap_or_else(|| "status updated".into());
            txn.append_status_log(t.log_entry(id, actor, now, reason))?;
        }
        txn.commit().await?;

        match transition {
            Some(t) => info!("booking {id} updated: {} -> {}", current.status, t.to),
            None => info!("booking {id} updated"),
        }
        Ok(booking)
    }

    pub async fn cancel_booking(&self, id: Ulid, actor: &Actor) -> Result<Booking, EngineError> {
        self.cancel_booking_with_reason(id, actor, "cancelled").await
    }

    /// Already-cancelled bookings are returned unchanged and nothing is logged.
    pub async fn cancel_booking_with_reason(
        &self,
        id: Ulid,
        actor: &Actor,
        reason: &str,
    ) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self.cancel_inner(id, actor, reason, |_| true).await.map(|b| b.0);
        observability::record_outcome("cancel", started, &result);
        result
    }

    /// Cancel a temporary booking whose confirmation deadline has passed.
    /// Conditions are re-checked under the write lock; returns `None` if the
    /// booking no longer qualifies.
    pub async fn auto_cancel_expired(&self, id: Ulid, now: Ms) -> Result<Option<Booking>, EngineError> {
        let started = Instant::now();
        let result = self
            .cancel_inner(id, &Actor::system(), "confirmation deadline passed", |b| {
                is_expired_temporary(b, now)
            })
            .await;
        observability::record_outcome("auto_cancel", started, &result);
        match result? {
            (booking, true) => {
                metrics::counter!(observability::BOOKINGS_AUTO_CANCELLED_TOTAL).increment(1);
                Ok(Some(booking))
            }
            (_, false) => Ok(None),
        }
    }

    /// Returns the booking and whether it was cancelled by this call.
    async fn cancel_inner(
        &self,
        id: Ulid,
        actor: &Actor,
        reason: &str,
        qualifies: impl Fn(&Booking) -> bool,
    ) -> Result<(Booking, bool), EngineError> {
        validate_text("reason", Some(reason), MAX_REASON_LEN)?;
        let mut txn = self.store.begin().await;
        let current = txn.get(&id)?.clone();
        if !qualifies(&current) {
            return Ok((current, false));
        }
        let Some(transition) = status::transition(current.status, BookingStatus::Cancelled)? else {
            debug!("booking {id} already cancelled");
            return Ok((current, false));
        };

        let now = now_ms();
        let booking = txn.update(
            &id,
            &FieldPatch {
                status: Some(BookingStatus::Cancelled),
                updated_by: actor.elevated.then_some(actor.id),
                updated_at: now,
                ..FieldPatch::default()
            },
        )?;
        txn.append_status_log(transition.log_entry(id, actor, now, reason))?;
        txn.commit().await?;

        info!("booking {id} cancelled ({reason})");
        Ok((booking, true))
    }

    /// Advisory: the answer may be stale by the time the caller acts on it.
    pub async fn check_availability(&self, span: Span, exclude: Option<Ulid>) -> Result<bool, EngineError> {
        validate_span(&span)?;
        let tables = self.store.read().await;
        Ok(is_available(&tables, &span, exclude))
    }

    /// Temporary pending bookings with automatic cancellation whose deadline
    /// is at or before `now`.
    pub async fn collect_expired_temporary(&self, now: Ms) -> Vec<Ulid> {
        self.store
            .read()
            .await
            .bookings()
            .filter(|b| is_expired_temporary(b, now))
            .map(|b| b.id)
            .collect()
    }

    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        self.store.compact().await?;
        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.store.appends_since_compact().await
    }

    /// Copy current catalog name and price into line items. Lookups run
    /// concurrently and before any lock is taken.
    async fn price_options(&self, selections: &[OptionSelection]) -> Result<Vec<LineItem>, EngineError> {
        let found = futures::future::join_all(selections.iter().map(|s| self.catalog.get(s.option_id))).await;
        selections
            .iter()
            .zip(found)
            .map(|(sel, option)| {
                let option = option.ok_or(EngineError::NotFound(Entity::Option, sel.option_id))?;
                if !option.active {
                    return Err(EngineError::Validation(format!("option {} is inactive", option.id)));
                }
                Ok(LineItem {
                    option_id: option.id,
                    name: option.name,
                    quantity: sel.quantity,
                    unit_price: option.unit_price,
                })
            })
            .collect()
    }
}

fn is_expired_temporary(b: &Booking, now: Ms) -> bool {
    b.booking_type == BookingType::Temporary
        && b.status == BookingStatus::Pending
        && b.automatic_cancellation
        && b.confirmation_deadline.is_some_and(|d| d <= now)
}
