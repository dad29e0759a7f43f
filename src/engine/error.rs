use ulid::Ulid;

use crate::model::{BookingStatus, EmptySpan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Booking,
    User,
    Option,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entity::Booking => f.write_str("booking"),
            Entity::User => f.write_str("user"),
            Entity::Option => f.write_str("option"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    Validation(String),
    NotFound(Entity, Ulid),
    /// Overlaps the active booking with this id.
    Conflict(Ulid),
    InvalidTransition {
        from: Option<BookingStatus>,
        to: BookingStatus,
    },
    /// The commit did not reach disk. Safe to retry the whole operation.
    StorageFailure(String),
    ConstraintViolation(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::StorageFailure(_))
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(..) => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::StorageFailure(_) => "storage_failure",
            EngineError::ConstraintViolation(_) => "constraint_violation",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EngineError::NotFound(entity, id) => write!(f, "{entity} not found: {id}"),
            EngineError::Conflict(id) => write!(f, "conflict with booking: {id}"),
            EngineError::InvalidTransition { from: Some(from), to } => {
                write!(f, "invalid status transition: {from} -> {to}")
            }
            EngineError::InvalidTransition { from: None, to } => {
                write!(f, "invalid initial status: {to}")
            }
            EngineError::StorageFailure(e) => write!(f, "storage failure: {e}"),
            EngineError::ConstraintViolation(msg) => write!(f, "constraint violation: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<EmptySpan> for EngineError {
    fn from(e: EmptySpan) -> Self {
        EngineError::Validation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_storage_failures_are_retryable() {
        assert!(EngineError::StorageFailure("disk full".into()).is_retryable());
        assert!(!EngineError::Conflict(Ulid::new()).is_retryable());
        assert!(!EngineError::Validation("bad".into()).is_retryable());
    }

    #[test]
    fn display_messages() {
        let id = Ulid::new();
        assert_eq!(
            EngineError::NotFound(Entity::User, id).to_string(),
            format!("user not found: {id}")
        );
        assert_eq!(
            EngineError::InvalidTransition {
                from: Some(BookingStatus::Rejected),
                to: BookingStatus::Approved,
            }
            .to_string(),
            "invalid status transition: rejected -> approved"
        );
        let empty: EngineError = EmptySpan { start: 5, end: 5 }.into();
        assert!(matches!(empty, EngineError::Validation(_)));
    }
}
