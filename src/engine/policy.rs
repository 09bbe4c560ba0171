use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_times(start: Ms, end: Ms) -> Result<(), EngineError> {
    if start >= end {
        return Err(EngineError::Validation(
            "start_time must be before end_time".into(),
        ));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end - start > MAX_SLOT_DURATION_MS {
        return Err(EngineError::LimitExceeded("slot too long"));
    }
    Ok(())
}

pub(crate) fn validate_subject(subject: &str) -> Result<(), EngineError> {
    if subject.trim().is_empty() {
        return Err(EngineError::Validation("subject is required".into()));
    }
    if subject.len() > MAX_SUBJECT_LEN {
        return Err(EngineError::LimitExceeded("subject too long"));
    }
    Ok(())
}

pub(crate) fn validate_description(description: &str) -> Result<(), EngineError> {
    if description.len() > MAX_DESCRIPTION_LEN {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    Ok(())
}

pub(crate) fn validate_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 {
        return Err(EngineError::Validation("capacity must be at least 1".into()));
    }
    if capacity > MAX_CAPACITY {
        return Err(EngineError::LimitExceeded("capacity too large"));
    }
    Ok(())
}

pub(crate) fn validate_new_slot(new: &NewSlot) -> Result<(), EngineError> {
    validate_subject(&new.subject)?;
    if let Some(d) = &new.description {
        validate_description(d)?;
    }
    validate_times(new.start_time, new.end_time)?;
    validate_capacity(new.capacity.unwrap_or(1))
}

pub(crate) fn validate_user(user: &User) -> Result<(), EngineError> {
    if user.name.trim().is_empty() {
        return Err(EngineError::Validation("name is required".into()));
    }
    if !user.email.contains('@') {
        return Err(EngineError::Validation("email is invalid".into()));
    }
    if user.name.len() > MAX_NAME_LEN || user.email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("user field too long"));
    }
    Ok(())
}

/// Apply a tutor's patch to a copy of `current`, keeping every slot invariant.
///
/// Status is derived from the seat count; the only status a patch may force
/// is `cancelled`, and a cancelled slot never comes back.
pub(crate) fn patched_slot(current: &Slot, patch: &SlotPatch) -> Result<Slot, EngineError> {
    let mut next = current.clone();
    if let Some(subject) = &patch.subject {
        validate_subject(subject)?;
        next.subject = subject.clone();
    }
    if let Some(description) = &patch.description {
        validate_description(description)?;
        next.description = description.clone();
    }
    next.start_time = patch.start_time.unwrap_or(current.start_time);
    next.end_time = patch.end_time.unwrap_or(current.end_time);
    validate_times(next.start_time, next.end_time)?;

    if let Some(capacity) = patch.capacity {
        validate_capacity(capacity)?;
        if capacity < current.booked_count {
            return Err(EngineError::Validation(format!(
                "capacity {capacity} is below the {} seats already booked",
                current.booked_count
            )));
        }
        next.capacity = capacity;
    }

    if patch.status == Some(SlotStatus::Cancelled) {
        next.status = SlotStatus::Cancelled;
    } else {
        next.status = next.derived_status();
        if let Some(requested) = patch.status
            && requested != next.status
        {
            return Err(EngineError::Validation(format!(
                "status {} contradicts seat count; slot is {}",
                requested.as_str(),
                next.status.as_str()
            )));
        }
    }
    Ok(next)
}

/// "< 2 hours blocks, ≥ 2 hours allows."
pub(crate) fn check_cancellation_window(start_time: Ms, now: Ms) -> Result<(), EngineError> {
    let starts_in = start_time - now;
    if starts_in < CANCELLATION_WINDOW_MS {
        return Err(EngineError::CancellationWindowExpired { starts_in });
    }
    Ok(())
}

/// Seat bookkeeping after one confirmed booking on the slot was cancelled.
/// A slot the tutor already cancelled stays cancelled.
pub(crate) fn release_seat(slot: &mut Slot, remaining_confirmed: usize) {
    if remaining_confirmed == 0 {
        slot.booked_count = 0;
        slot.status = SlotStatus::Cancelled;
    } else {
        slot.booked_count = slot.booked_count.saturating_sub(1);
        if slot.status != SlotStatus::Cancelled {
            slot.status = SlotStatus::Available;
        }
    }
}

/// Seat bookkeeping after a booking was confirmed on the slot.
pub(crate) fn take_seat(slot: &mut Slot) {
    slot.booked_count += 1;
    slot.status = if slot.booked_count >= slot.capacity {
        SlotStatus::Booked
    } else {
        SlotStatus::Available
    };
}
