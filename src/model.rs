use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds (UTC). The only instant type.
pub type Ms = i64;

/// Minor currency units.
pub type Amount = i64;

pub const HOUR_MS: Ms = 3_600_000;
pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

/// Returned by [`Span::try_new`] for zero-length or inverted input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmptySpan {
    pub start: Ms,
    pub end: Ms,
}

impl fmt::Display for EmptySpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interval end {} must be after start {}", self.end, self.start)
    }
}

impl std::error::Error for EmptySpan {}

impl Span {
    /// Trusted constructor for spans built from already-validated bounds.
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for caller-supplied bounds.
    pub fn try_new(start: Ms, end: Ms) -> Result<Self, EmptySpan> {
        if end <= start {
            return Err(EmptySpan { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 4] = [
        BookingStatus::Pending,
        BookingStatus::Approved,
        BookingStatus::Rejected,
        BookingStatus::Cancelled,
    ];

    /// Active bookings hold their interval and count toward conflicts.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Approved)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Approved => "approved",
            BookingStatus::Rejected => "rejected",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingType {
    /// Provisional; may carry a confirmation deadline.
    Temporary,
    Confirmed,
}

/// A catalog option attached to a booking. Name and price are copied from the
/// catalog when attached and never re-read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub option_id: Ulid,
    pub name: String,
    pub quantity: u32,
    pub unit_price: Amount,
}

impl LineItem {
    pub fn subtotal(&self) -> Amount {
        self.unit_price * self.quantity as Amount
    }
}

pub fn line_items_total(items: &[LineItem]) -> Amount {
    items.iter().map(LineItem::subtotal).sum()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Option<Ulid>,
    pub span: Span,
    pub status: BookingStatus,
    pub booking_type: BookingType,
    pub confirmation_deadline: Option<Ms>,
    pub automatic_cancellation: bool,
    pub purpose: Option<String>,
    pub notes: Option<String>,
    pub options: Vec<LineItem>,
    pub total_amount: Amount,
    pub created_by: Option<Ulid>,
    pub updated_by: Option<Ulid>,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub idempotency_key: Option<String>,
}

/// Catalog entry, owned by the catalog collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogOption {
    pub id: Ulid,
    pub name: String,
    pub unit_price: Amount,
    pub unit: String,
    pub active: bool,
}

/// Append-only audit row. `previous_status` is `None` for creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusLogEntry {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub previous_status: Option<BookingStatus>,
    pub new_status: BookingStatus,
    pub changed_by: Ulid,
    pub changed_at: Ms,
    pub reason: String,
}

/// Field-level patch applied by the store. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldPatch {
    pub span: Option<Span>,
    pub status: Option<BookingStatus>,
    pub booking_type: Option<BookingType>,
    /// `Some(None)` clears the deadline.
    pub confirmation_deadline: Option<Option<Ms>>,
    pub automatic_cancellation: Option<bool>,
    /// `Some(None)` clears the field.
    pub purpose: Option<Option<String>>,
    pub notes: Option<Option<String>>,
    pub updated_by: Option<Ulid>,
    pub updated_at: Ms,
}

// ── WAL record format ───────────────────────────────────────────

/// One row-level change inside a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    /// Insert or replace the booking row together with its line items.
    BookingPut(Booking),
    StatusLogged(StatusLogEntry),
}

impl Change {
    pub fn booking_id(&self) -> Ulid {
        match self {
            Change::BookingPut(b) => b.id,
            Change::StatusLogged(e) => e.booking_id,
        }
    }
}

/// All changes of one transaction. Written to the WAL as a single entry, so
/// replay sees either every change or none of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: Ulid,
    pub committed_at: Ms,
    pub changes: Vec<Change>,
}

// ── Collaborator-facing types ───────────────────────────────────

/// Who performs a mutation. Supplied by the identity layer and trusted as is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    /// Staff privilege: may pick an initial status and create placeholders.
    pub elevated: bool,
}

impl Actor {
    pub fn user(id: Ulid) -> Self {
        Self { id, elevated: false }
    }

    pub fn staff(id: Ulid) -> Self {
        Self { id, elevated: true }
    }

    /// Background maintenance actor.
    pub fn system() -> Self {
        Self {
            id: Ulid::nil(),
            elevated: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

// ── Request types ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionSelection {
    pub option_id: Ulid,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBookingRequest {
    /// Target user. Defaults to the actor for self-service requests.
    pub user_id: Option<Ulid>,
    pub start: Ms,
    pub end: Ms,
    pub booking_type: BookingType,
    pub confirmation_deadline: Option<Ms>,
    pub automatic_cancellation: bool,
    pub purpose: Option<String>,
    pub notes: Option<String>,
    pub options: Vec<OptionSelection>,
    /// Initial status; honoured for elevated actors only.
    pub status: Option<BookingStatus>,
    pub idempotency_key: Option<String>,
}

impl CreateBookingRequest {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self {
            user_id: None,
            start,
            end,
            booking_type: BookingType::Confirmed,
            confirmation_deadline: None,
            automatic_cancellation: false,
            purpose: None,
            notes: None,
            options: Vec::new(),
            status: None,
            idempotency_key: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBookingRequest {
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub booking_type: Option<BookingType>,
    pub confirmation_deadline: Option<Ms>,
    pub automatic_cancellation: Option<bool>,
    /// Absent leaves the field alone, `null` clears it.
    #[serde(default, deserialize_with = "present")]
    pub purpose: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub notes: Option<Option<String>>,
    pub status: Option<BookingStatus>,
    /// `Some` replaces the whole line-item set, even when empty.
    pub options: Option<Vec<OptionSelection>>,
    /// Audit reason for a status change.
    pub reason: Option<String>,
}

/// Distinguishes an explicit `null` from a missing field.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

// ── Query types ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Is(BookingStatus),
    /// Temporary, pending, and the confirmation deadline falls within the
    /// next 48 hours.
    ExpiringSoon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    #[default]
    CreatedAt,
    UpdatedAt,
    Start,
    End,
    Status,
    TotalAmount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub status: Option<StatusFilter>,
    pub booking_type: Option<BookingType>,
    pub user_id: Option<Ulid>,
    /// Bookings starting on or after this date.
    pub from: Option<NaiveDate>,
    /// Bookings starting on or before this date.
    pub to: Option<NaiveDate>,
    /// Case-insensitive match over user name, email and purpose.
    pub search: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based.
    pub page: u32,
    pub limit: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            limit: crate::limits::DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: usize,
    pub page: u32,
    pub limit: u32,
    pub has_next_page: bool,
}

/// Inclusive range of calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    BusinessHours,
}

/// Candidate reservation window for display; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub start: Ms,
    pub end: Ms,
    pub available: bool,
    #[serde(rename = "type")]
    pub kind: SlotKind,
}

impl Slot {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: Ulid,
    pub title: String,
    pub start: Ms,
    pub end: Ms,
    pub status: BookingStatus,
    pub booking_type: BookingType,
    pub user_id: Option<Ulid>,
    pub user_name: Option<String>,
    pub purpose: Option<String>,
    pub created_at: Ms,
}
