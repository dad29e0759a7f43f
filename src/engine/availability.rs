use chrono::{Datelike, FixedOffset, NaiveDate, NaiveTime, Offset, Utc, Weekday};

use crate::limits::MAX_PROJECTION_DAYS;
use crate::model::*;

use super::{Engine, EngineError};

// ── Business hours ────────────────────────────────────────────────

/// Studio opening hours on weekdays, in the studio's local offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessHours {
    open_hour: u32,
    close_hour: u32,
    slot_minutes: u32,
    utc_offset: FixedOffset,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            open_hour: 9,
            close_hour: 22,
            slot_minutes: 60,
            utc_offset: Utc.fix(),
        }
    }
}

impl BusinessHours {
    pub fn new(
        open_hour: u32,
        close_hour: u32,
        slot_minutes: u32,
        utc_offset_minutes: i32,
    ) -> Result<Self, EngineError> {
        if open_hour >= close_hour || close_hour > 24 {
            return Err(EngineError::Validation(format!(
                "opening hours {open_hour}..{close_hour} are not a valid day window"
            )));
        }
        if slot_minutes == 0 || slot_minutes > (close_hour - open_hour) * 60 {
            return Err(EngineError::Validation(format!(
                "slot length {slot_minutes} min does not fit the opening hours"
            )));
        }
        let utc_offset = FixedOffset::east_opt(utc_offset_minutes.saturating_mul(60))
            .ok_or_else(|| EngineError::Validation(format!("invalid UTC offset {utc_offset_minutes} min")))?;
        Ok(Self {
            open_hour,
            close_hour,
            slot_minutes,
            utc_offset,
        })
    }

    pub fn open_hour(&self) -> u32 {
        self.open_hour
    }

    pub fn close_hour(&self) -> u32 {
        self.close_hour
    }

    pub fn slot_minutes(&self) -> u32 {
        self.slot_minutes
    }

    pub fn utc_offset(&self) -> FixedOffset {
        self.utc_offset
    }

    /// Instant of `minute_of_day` local minutes after midnight on `date`.
    /// `24 * 60` is the next midnight.
    pub fn at(&self, date: NaiveDate, minute_of_day: u32) -> Ms {
        let midnight_utc = date.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
        midnight_utc - self.utc_offset.local_minus_utc() as Ms * 1000 + minute_of_day as Ms * MINUTE_MS
    }

    /// Local midnight to local midnight.
    pub fn day_bounds(&self, date: NaiveDate) -> Span {
        Span::new(self.at(date, 0), self.at(date, 24 * 60))
    }

    /// Every instant of the inclusive date range.
    pub fn range_bounds(&self, range: &DateRange) -> Span {
        Span::new(self.at(range.start, 0), self.at(range.end, 24 * 60))
    }

    pub fn is_open_on(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }
}

// ── Projection ────────────────────────────────────────────────────

/// Slot grid over a date range, checked against a snapshot of the active
/// bookings. Pure and restartable: `iter()` may be called any number of times.
#[derive(Debug, Clone)]
pub struct Projection {
    range: DateRange,
    hours: BusinessHours,
    /// Sorted by start.
    booked: Vec<Span>,
}

impl Projection {
    pub fn new(range: DateRange, hours: BusinessHours, mut booked: Vec<Span>) -> Self {
        booked.sort_by_key(|s| s.start);
        Self { range, hours, booked }
    }

    pub fn range(&self) -> DateRange {
        self.range
    }

    pub fn iter(&self) -> impl Iterator<Item = Slot> + '_ {
        let open = self.hours.open_hour * 60;
        let close = self.hours.close_hour * 60;
        let step = self.hours.slot_minutes;
        self.range
            .start
            .iter_days()
            .take(self.range.days().max(0) as usize)
            .filter(move |date| self.hours.is_open_on(*date))
            .flat_map(move |date| {
                (open..close)
                    .step_by(step as usize)
                    .take_while(move |m| m + step <= close)
                    .map(move |m| {
                        let span = Span::new(self.hours.at(date, m), self.hours.at(date, m + step));
                        Slot {
                            start: span.start,
                            end: span.end,
                            available: self.is_free(&span),
                            kind: SlotKind::BusinessHours,
                        }
                    })
            })
    }

    /// Scan stops at the first booking starting at or after the slot end.
    fn is_free(&self, slot: &Span) -> bool {
        !self
            .booked
            .iter()
            .take_while(|b| b.start < slot.end)
            .any(|b| b.end > slot.start)
    }
}

impl Engine {
    /// Bookable slots for the range. Active bookings are read once.
    pub async fn project_availability(&self, range: DateRange) -> Result<Projection, EngineError> {
        validate_range(&range)?;
        let window = self.hours.range_bounds(&range);
        let booked = self
            .store
            .list_active_overlapping(&window, None)
            .await
            .into_iter()
            .map(|b| b.span)
            .collect();
        Ok(Projection::new(range, self.hours, booked))
    }
}

pub(super) fn validate_range(range: &DateRange) -> Result<(), EngineError> {
    if range.end < range.start {
        return Err(EngineError::Validation("date range ends before it starts".into()));
    }
    if range.days() > MAX_PROJECTION_DAYS {
        return Err(EngineError::Validation(format!(
            "date range longer than {MAX_PROJECTION_DAYS} days"
        )));
    }
    Ok(())
}
