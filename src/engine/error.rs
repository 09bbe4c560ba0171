use ulid::Ulid;

use crate::model::Ms;

/// Taxonomy family of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Malformed input, rejected before any transaction.
    Validation,
    /// Business rule violated inside the transaction; fully rolled back.
    Conflict,
    /// Identity does not own or participate in the target.
    Authorization,
    /// Time-based rule.
    Policy,
    NotFound,
    /// Storage failure. Fatal to the request.
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("slot overlaps existing slot {existing}")]
    Overlap { existing: Ulid },
    #[error("slot {0} is not available")]
    SlotUnavailable(Ulid),
    #[error("student already has an overlapping booking {existing}")]
    OverlappingBooking { existing: Ulid },
    #[error("slot {0} already booked by this student")]
    AlreadyBooked(Ulid),
    #[error("booking {0} is already cancelled")]
    AlreadyCancelled(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("slot {0} not found or not owned by caller")]
    NotFoundOrUnauthorized(Ulid),
    #[error("not authorized to modify {0}")]
    Unauthorized(Ulid),
    #[error("cannot cancel within 2 hours of the session (starts in {} minutes)", .starts_in / 60_000)]
    CancellationWindowExpired { starts_in: Ms },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn category(&self) -> Category {
        match self {
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => Category::Validation,
            EngineError::Overlap { .. }
            | EngineError::SlotUnavailable(_)
            | EngineError::OverlappingBooking { .. }
            | EngineError::AlreadyBooked(_)
            | EngineError::AlreadyCancelled(_)
            | EngineError::AlreadyExists(_) => Category::Conflict,
            EngineError::NotFoundOrUnauthorized(_) | EngineError::Unauthorized(_) => {
                Category::Authorization
            }
            EngineError::CancellationWindowExpired { .. } => Category::Policy,
            EngineError::NotFound(_) => Category::NotFound,
            EngineError::Storage(_) => Category::Internal,
        }
    }

    /// Stable machine-readable code; safe to match on in clients.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::Overlap { .. } => "overlap_error",
            EngineError::SlotUnavailable(_) => "slot_unavailable",
            EngineError::OverlappingBooking { .. } => "overlapping_booking",
            EngineError::AlreadyBooked(_) => "already_booked",
            EngineError::AlreadyCancelled(_) => "already_cancelled",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::NotFoundOrUnauthorized(_) => "not_found_or_unauthorized",
            EngineError::Unauthorized(_) => "unauthorized",
            EngineError::CancellationWindowExpired { .. } => "cancellation_window_expired",
            EngineError::NotFound(_) => "not_found",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Storage(_) => "internal_error",
        }
    }
}
