use std::sync::LazyLock;

use regex::Regex;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)+$")
        .expect("email regex compiles")
});

pub fn is_valid_email(email: &str) -> bool {
    email.len() <= MAX_EMAIL_LEN && EMAIL_RE.is_match(email)
}

fn text(field: &str, value: &str, max: usize) -> Result<(), EngineError> {
    let len = value.chars().count();
    if len == 0 || value.trim().is_empty() {
        return Err(EngineError::Invalid(format!("{field} must not be empty")));
    }
    if len > max {
        return Err(EngineError::Invalid(format!(
            "{field} exceeds {max} characters"
        )));
    }
    Ok(())
}

fn email(field: &str, value: &str) -> Result<(), EngineError> {
    if !is_valid_email(value) {
        return Err(EngineError::Invalid(format!(
            "{field} is not a valid email address"
        )));
    }
    Ok(())
}

pub(super) fn new_event(event: &NewEvent) -> Result<(), EngineError> {
    text("title", &event.title, MAX_TITLE_LEN)?;
    text("description", &event.description, MAX_DESCRIPTION_LEN)?;
    text("creator_name", &event.creator_name, MAX_PERSON_NAME_LEN)?;
    email("creator_email", &event.creator_email)
}

pub(super) fn new_slots(slots: &[NewTimeSlot]) -> Result<(), EngineError> {
    if slots.is_empty() {
        return Err(EngineError::Invalid(
            "at least one time slot is required".into(),
        ));
    }
    if slots.len() > MAX_SLOTS_PER_EVENT {
        return Err(EngineError::Invalid(format!(
            "at most {MAX_SLOTS_PER_EVENT} time slots per event"
        )));
    }
    for (i, slot) in slots.iter().enumerate() {
        if !(MIN_BOOKINGS_PER_SLOT..=MAX_BOOKINGS_PER_SLOT).contains(&slot.max_bookings) {
            return Err(EngineError::Invalid(format!(
                "time slot {i}: max_bookings must be between {MIN_BOOKINGS_PER_SLOT} and {MAX_BOOKINGS_PER_SLOT}"
            )));
        }
        if slot.start_time >= slot.end_time {
            return Err(EngineError::Invalid(format!(
                "time slot {i}: start_time must be before end_time"
            )));
        }
    }
    Ok(())
}

pub(super) fn patch(patch: &EventPatch) -> Result<(), EngineError> {
    if patch.is_empty() {
        return Err(EngineError::Invalid("no fields to update".into()));
    }
    if let Some(title) = &patch.title {
        text("title", title, MAX_TITLE_LEN)?;
    }
    if let Some(description) = &patch.description {
        text("description", description, MAX_DESCRIPTION_LEN)?;
    }
    if let Some(name) = &patch.creator_name {
        text("creator_name", name, MAX_PERSON_NAME_LEN)?;
    }
    if let Some(addr) = &patch.creator_email {
        email("creator_email", addr)?;
    }
    Ok(())
}

pub(super) fn booking_request(req: &BookingRequest) -> Result<(), EngineError> {
    text("attendee_name", &req.attendee_name, MAX_PERSON_NAME_LEN)?;
    email("attendee_email", &req.attendee_email)
}
