use ulid::Ulid;

use crate::model::*;

use super::store::Tables;
use super::EngineError;

/// Bounds check on a caller-supplied interval, after `Span::try_new`.
pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::Validation("timestamp out of range".into()));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::Validation("interval too long".into()));
    }
    Ok(())
}

/// Fails with the first active booking overlapping `span`, ignoring `exclude`.
///
/// Enforcing only while the caller holds the write transaction the result
/// is acted on in; otherwise it is a snapshot answer.
pub(crate) fn check_no_conflict(tables: &Tables, span: &Span, exclude: Option<Ulid>) -> Result<(), EngineError> {
    match tables.active_overlapping(*span, exclude).next() {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}

pub(crate) fn is_available(tables: &Tables, span: &Span, exclude: Option<Ulid>) -> bool {
    check_no_conflict(tables, span, exclude).is_ok()
}
