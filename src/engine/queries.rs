use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::validate_range;
use super::error::Entity;
use super::{now_ms, Engine, EngineError};

const EXPIRING_SOON_WINDOW_MS: Ms = 48 * HOUR_MS;

/// Bounds derived from a `BookingFilter`, resolved once per query.
struct Bounds {
    /// Inclusive.
    from: Option<Ms>,
    /// Exclusive.
    to: Option<Ms>,
    now: Ms,
}

fn matches_filter(b: &Booking, filter: &BookingFilter, bounds: &Bounds) -> bool {
    let status_ok = match filter.status {
        None => true,
        Some(StatusFilter::Is(status)) => b.status == status,
        Some(StatusFilter::ExpiringSoon) => {
            b.booking_type == BookingType::Temporary
                && b.status == BookingStatus::Pending
                && b.confirmation_deadline
                    .is_some_and(|d| d > bounds.now && d <= bounds.now + EXPIRING_SOON_WINDOW_MS)
        }
    };
    status_ok
        && filter.booking_type.is_none_or(|t| b.booking_type == t)
        && filter.user_id.is_none_or(|u| b.user_id == Some(u))
        && bounds.from.is_none_or(|from| b.span.start >= from)
        && bounds.to.is_none_or(|to| b.span.start < to)
}

fn compare(a: &Booking, b: &Booking, field: SortField) -> Ordering {
    let ord = match field {
        SortField::CreatedAt => a.created_at.cmp(&b.created_at),
        SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        SortField::Start => a.span.start.cmp(&b.span.start),
        SortField::End => a.span.end.cmp(&b.span.end),
        SortField::Status => a.status.as_str().cmp(b.status.as_str()),
        SortField::TotalAmount => a.total_amount.cmp(&b.total_amount),
    };
    // Stable order for equal keys.
    ord.then_with(|| a.id.cmp(&b.id))
}

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.store.get(&id).await
    }

    /// Status log rows of one booking, oldest first.
    pub async fn status_history(&self, id: Ulid) -> Result<Vec<StatusLogEntry>, EngineError> {
        let tables = self.store.read().await;
        if tables.get(&id).is_none() {
            return Err(EngineError::NotFound(Entity::Booking, id));
        }
        Ok(tables.history(&id))
    }

    pub async fn query_bookings(
        &self,
        filter: &BookingFilter,
        sort: SortField,
        order: SortOrder,
        page: PageRequest,
    ) -> Result<Page<Booking>, EngineError> {
        if page.page == 0 || page.limit == 0 {
            return Err(EngineError::Validation("page and limit start at 1".into()));
        }
        let limit = page.limit.min(MAX_PAGE_SIZE);
        if let (Some(from), Some(to)) = (filter.from, filter.to)
            && to < from {
                return Err(EngineError::Validation("date filter ends before it starts".into()));
            }
        let needle = match filter.search.as_deref().map(str::trim) {
            Some(s) if s.len() > MAX_SEARCH_LEN => {
                return Err(EngineError::Validation(format!(
                    "search exceeds {MAX_SEARCH_LEN} bytes"
                )));
            }
            Some(s) if !s.is_empty() => Some(s.to_lowercase()),
            _ => None,
        };

        let bounds = Bounds {
            from: filter.from.map(|d| self.hours.at(d, 0)),
            to: filter.to.map(|d| self.hours.at(d, 24 * 60)),
            now: now_ms(),
        };
        let mut items: Vec<Booking> = self
            .store
            .read()
            .await
            .bookings()
            .filter(|b| matches_filter(b, filter, &bounds))
            .cloned()
            .collect();

        if let Some(needle) = needle {
            let users = self.display_infos(items.iter().filter_map(|b| b.user_id)).await;
            items.retain(|b| {
                let purpose_hit = b
                    .purpose
                    .as_deref()
                    .is_some_and(|p| p.to_lowercase().contains(&needle));
                let user_hit = b.user_id.and_then(|u| users.get(&u)).is_some_and(|info| {
                    info.name.to_lowercase().contains(&needle) || info.email.to_lowercase().contains(&needle)
                });
                purpose_hit || user_hit
            });
        }

        items.sort_by(|a, b| match order {
            SortOrder::Asc => compare(a, b, sort),
            SortOrder::Desc => compare(b, a, sort),
        });

        let total_count = items.len();
        let offset = (page.page as usize - 1).saturating_mul(limit as usize);
        let items: Vec<Booking> = items.into_iter().skip(offset).take(limit as usize).collect();
        let has_next_page = offset.saturating_add(items.len()) < total_count;
        Ok(Page {
            items,
            total_count,
            page: page.page,
            limit,
            has_next_page,
        })
    }

    /// Non-cancelled bookings touching the range, ordered by start.
    pub async fn calendar_events(&self, range: DateRange) -> Result<Vec<CalendarEvent>, EngineError> {
        validate_range(&range)?;
        let window = self.hours.range_bounds(&range);
        let mut bookings: Vec<Booking> = self
            .store
            .read()
            .await
            .bookings()
            .filter(|b| b.status != BookingStatus::Cancelled && b.span.overlaps(&window))
            .cloned()
            .collect();
        bookings.sort_by(|a, b| a.span.start.cmp(&b.span.start).then_with(|| a.id.cmp(&b.id)));

        let users = self.display_infos(bookings.iter().filter_map(|b| b.user_id)).await;
        Ok(bookings
            .into_iter()
            .map(|b| {
                let user_name = b.user_id.and_then(|u| users.get(&u)).map(|info| info.name.clone());
                let title = match (&user_name, &b.purpose) {
                    (Some(name), Some(purpose)) => format!("{name} - {purpose}"),
                    (Some(name), None) => name.clone(),
                    (None, Some(purpose)) => purpose.clone(),
                    (None, None) => "Reserved".to_string(),
                };
                CalendarEvent {
                    id: b.id,
                    title,
                    start: b.span.start,
                    end: b.span.end,
                    status: b.status,
                    booking_type: b.booking_type,
                    user_id: b.user_id,
                    user_name,
                    purpose: b.purpose,
                    created_at: b.created_at,
                }
            })
            .collect())
    }

    /// Concurrent directory lookups, one per distinct user. Unknown users are
    /// left out of the map.
    async fn display_infos(&self, ids: impl Iterator<Item = Ulid>) -> HashMap<Ulid, UserInfo> {
        let ids: Vec<Ulid> = ids.collect::<HashSet<_>>().into_iter().collect();
        let infos = futures::future::join_all(ids.iter().map(|id| self.users.display_info(*id))).await;
        ids.into_iter()
            .zip(infos)
            .filter_map(|(id, info)| info.map(|i| (id, i)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Ms = 1_748_822_400_000;

    fn booking(start: Ms, created_at: Ms) -> Booking {
        Booking {
            id: Ulid::new(),
            user_id: None,
            span: Span::new(start, start + HOUR_MS),
            status: BookingStatus::Pending,
            booking_type: BookingType::Temporary,
            confirmation_deadline: None,
            automatic_cancellation: false,
            purpose: None,
            notes: None,
            options: Vec::new(),
            total_amount: 0,
            created_by: None,
            updated_by: None,
            created_at,
            updated_at: created_at,
            idempotency_key: None,
        }
    }

    #[test]
    fn expiring_soon_window_is_half_open_at_now() {
        let now = BASE;
        let bounds = Bounds { from: None, to: None, now };
        let filter = BookingFilter {
            status: Some(StatusFilter::ExpiringSoon),
            ..BookingFilter::default()
        };
        let mut b = booking(BASE, BASE);
        for (deadline, expected) in [
            (now, false),
            (now + 1, true),
            (now + EXPIRING_SOON_WINDOW_MS, true),
            (now + EXPIRING_SOON_WINDOW_MS + 1, false),
        ] {
            b.confirmation_deadline = Some(deadline);
            assert_eq!(matches_filter(&b, &filter, &bounds), expected, "deadline {deadline}");
        }
        b.confirmation_deadline = Some(now + 1);
        b.booking_type = BookingType::Confirmed;
        assert!(!matches_filter(&b, &filter, &bounds));
    }

    #[test]
    fn date_bounds_compare_start() {
        let bounds = Bounds {
            from: Some(BASE),
            to: Some(BASE + 24 * HOUR_MS),
            now: BASE,
        };
        let filter = BookingFilter::default();
        assert!(matches_filter(&booking(BASE, BASE), &filter, &bounds));
        assert!(matches_filter(&booking(BASE + 23 * HOUR_MS, BASE), &filter, &bounds));
        assert!(!matches_filter(&booking(BASE + 24 * HOUR_MS, BASE), &filter, &bounds));
        assert!(!matches_filter(&booking(BASE - HOUR_MS, BASE), &filter, &bounds));
    }

    #[test]
    fn compare_breaks_ties_by_id() {
        let a = booking(BASE, BASE);
        let b = booking(BASE, BASE);
        assert_eq!(compare(&a, &b, SortField::CreatedAt), a.id.cmp(&b.id));
        let later = booking(BASE + HOUR_MS, BASE - 1);
        assert_eq!(compare(&a, &later, SortField::Start), Ordering::Less);
        assert_eq!(compare(&a, &later, SortField::CreatedAt), Ordering::Greater);
    }
}
