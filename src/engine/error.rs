use ulid::Ulid;

use crate::model::Rejection;

/// Coarse classification the front end maps to client-facing statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NotFound,
    Conflict,
    Validation,
    Internal,
}

#[derive(Debug)]
pub enum EngineError {
    EventNotFound(Ulid),
    SlotNotFound(Ulid),
    BookingNotFound(Ulid),
    SlotNotInEvent { slot_id: Ulid, event_id: Ulid },
    /// A business rejection surfaced as an error (only at the wire boundary).
    Rejected(Rejection),
    Invalid(String),
    WalError(String),
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::EventNotFound(_)
            | EngineError::SlotNotFound(_)
            | EngineError::BookingNotFound(_)
            | EngineError::SlotNotInEvent { .. } => ErrorClass::NotFound,
            EngineError::Rejected(_) => ErrorClass::Conflict,
            EngineError::Invalid(_) => ErrorClass::Validation,
            EngineError::WalError(_) => ErrorClass::Internal,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::EventNotFound(id) => write!(f, "event not found: {id}"),
            EngineError::SlotNotFound(id) => write!(f, "time slot not found: {id}"),
            EngineError::BookingNotFound(id) => {
                write!(f, "booking not found or email does not match: {id}")
            }
            EngineError::SlotNotInEvent { slot_id, event_id } => {
                write!(f, "time slot {slot_id} does not belong to event {event_id}")
            }
            EngineError::Rejected(rejection) => write!(f, "{}", rejection.message()),
            EngineError::Invalid(msg) => write!(f, "invalid input: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
