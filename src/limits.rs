use crate::model::Ms;

// ── Time bounds ─────────────────────────────────────────────────

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
/// A single booking may not exceed 31 days.
pub const MAX_SPAN_DURATION_MS: Ms = 31 * 24 * 3_600_000;

// ── Request payloads ────────────────────────────────────────────

pub const MAX_TEXT_LEN: usize = 4_096;
pub const MAX_REASON_LEN: usize = 512;
pub const MAX_LINE_ITEMS: usize = 64;
pub const MAX_LINE_ITEM_QUANTITY: u32 = 10_000;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;
pub const MAX_SEARCH_LEN: usize = 256;

// ── Reads ───────────────────────────────────────────────────────

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 200;
pub const MAX_PROJECTION_DAYS: i64 = 366;
