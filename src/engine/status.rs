use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// A validated status change that must be written to the status log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Option<BookingStatus>,
    pub to: BookingStatus,
}

impl Transition {
    pub fn log_entry(self, booking_id: Ulid, actor: &Actor, at: Ms, reason: impl Into<String>) -> StatusLogEntry {
        StatusLogEntry {
            id: Ulid::new(),
            booking_id,
            previous_status: self.from,
            new_status: self.to,
            changed_by: actor.id,
            changed_at: at,
            reason: reason.into(),
        }
    }
}

pub fn is_permitted(from: BookingStatus, to: BookingStatus) -> bool {
    use BookingStatus::*;
    matches!(
        (from, to),
        (Pending, Approved) | (Pending, Rejected) | (Pending, Cancelled) | (Approved, Cancelled)
    )
}

/// `Ok(None)` when `to == from`: a no-op that must not be logged.
pub fn transition(from: BookingStatus, to: BookingStatus) -> Result<Option<Transition>, EngineError> {
    if from == to {
        return Ok(None);
    }
    if !is_permitted(from, to) {
        return Err(EngineError::InvalidTransition { from: Some(from), to });
    }
    Ok(Some(Transition { from: Some(from), to }))
}

/// Creation is the implicit `null -> initial` transition. Only `pending`, or
/// `approved` for elevated actors, may start a booking.
pub fn initial(requested: Option<BookingStatus>, actor: &Actor) -> Result<Transition, EngineError> {
    let to = match requested {
        Some(status) if actor.elevated => status,
        Some(status) => {
            tracing::debug!("ignoring initial status {status} from non-elevated actor {}", actor.id);
            BookingStatus::Pending
        }
        None => BookingStatus::Pending,
    };
    match to {
        BookingStatus::Pending | BookingStatus::Approved => Ok(Transition { from: None, to }),
        other => Err(EngineError::InvalidTransition { from: None, to: other }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BookingStatus::*;

    #[test]
    fn permitted_table() {
        let allowed = [
            (Pending, Approved),
            (Pending, Rejected),
            (Pending, Cancelled),
            (Approved, Cancelled),
        ];
        for from in BookingStatus::ALL {
            for to in BookingStatus::ALL {
                assert_eq!(
                    is_permitted(from, to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn same_status_is_noop() {
        for s in BookingStatus::ALL {
            assert_eq!(transition(s, s), Ok(None));
        }
    }

    #[test]
    fn terminal_states_reject_everything() {
        for from in [Rejected, Cancelled] {
            for to in BookingStatus::ALL {
                if to == from {
                    continue;
                }
                assert_eq!(
                    transition(from, to),
                    Err(EngineError::InvalidTransition { from: Some(from), to })
                );
            }
        }
    }

    #[test]
    fn approved_cannot_go_back() {
        assert!(transition(Approved, Pending).is_err());
        assert!(transition(Approved, Rejected).is_err());
    }

    #[test]
    fn initial_defaults_to_pending() {
        let user = Actor::user(Ulid::new());
        assert_eq!(initial(None, &user).unwrap().to, Pending);
        // Non-elevated requests cannot pick a status.
        assert_eq!(initial(Some(Approved), &user).unwrap().to, Pending);
    }

    #[test]
    fn initial_staff_choice_is_validated() {
        let staff = Actor::staff(Ulid::new());
        assert_eq!(initial(Some(Approved), &staff).unwrap().to, Approved);
        assert_eq!(
            initial(Some(Cancelled), &staff),
            Err(EngineError::InvalidTransition { from: None, to: Cancelled })
        );
        assert!(initial(Some(Rejected), &staff).is_err());
    }

    #[test]
    fn log_entry_carries_actor_and_reason() {
        let actor = Actor::staff(Ulid::new());
        let booking_id = Ulid::new();
        let entry = Transition { from: Some(Pending), to: Approved }.log_entry(booking_id, &actor, 7, "ok");
        assert_eq!(entry.booking_id, booking_id);
        assert_eq!(entry.changed_by, actor.id);
        assert_eq!(entry.previous_status, Some(Pending));
        assert_eq!(entry.new_status, Approved);
        assert_eq!(entry.changed_at, 7);
        assert_eq!(entry.reason, "ok");
    }
}
