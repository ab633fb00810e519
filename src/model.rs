use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// All timestamps are UTC.
pub type Timestamp = DateTime<Utc>;

/// Status carried on every slot. Nothing transitions it today.
pub const SLOT_STATUS_AVAILABLE: &str = "available";

/// Placeholder title used when a booking's event cannot be resolved.
pub const UNKNOWN_EVENT_TITLE: &str = "N/A";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: Ulid,
    pub title: String,
    pub description: String,
    pub creator_name: String,
    pub creator_email: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Organizer-supplied fields of a new event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub title: String,
    pub description: String,
    pub creator_name: String,
    pub creator_email: String,
}

/// Partial update of an event. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub creator_name: Option<String>,
    pub creator_email: Option<String>,
}

impl EventPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.creator_name.is_none()
            && self.creator_email.is_none()
    }

    /// Merge the provided fields into `event`.
    pub fn apply(self, event: &mut Event) {
        if let Some(title) = self.title {
            event.title = title;
        }
        if let Some(description) = self.description {
            event.description = description;
        }
        if let Some(name) = self.creator_name {
            event.creator_name = name;
        }
        if let Some(email) = self.creator_email {
            event.creator_email = email;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub id: Ulid,
    pub event_id: Ulid,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub max_bookings: u32,
    pub status: String,
    pub created_at: Timestamp,
    /// Cached booking count. Must equal the number of bookings on the slot;
    /// the reconciler repairs it when it doesn't.
    pub current_bookings: u32,
}

/// Organizer-supplied fields of a new slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTimeSlot {
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub max_bookings: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub event_id: Ulid,
    pub time_slot_id: Ulid,
    pub attendee_name: String,
    pub attendee_email: String,
    pub created_at: Timestamp,
}

/// A booking request as delivered by the front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub event_id: Ulid,
    pub time_slot_id: Ulid,
    pub attendee_name: String,
    pub attendee_email: String,
}

/// Booking enriched with its event title and slot times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingDetails {
    #[serde(flatten)]
    pub booking: Booking,
    pub event_title: String,
    pub slot_start_time: Timestamp,
    pub slot_end_time: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventWithSlots {
    #[serde(flatten)]
    pub event: Event,
    /// Ordered by `start_time`.
    pub time_slots: Vec<TimeSlot>,
}

/// Business-rule rejection of a booking request. Not a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    SlotFull { max_bookings: u32 },
    DuplicateBooking,
}

impl Rejection {
    pub fn message(&self) -> &'static str {
        match self {
            Rejection::SlotFull { .. } => "This time slot is completely booked.",
            Rejection::DuplicateBooking => "You have already booked this time slot.",
        }
    }
}

/// Outcome of admission: the created booking, or why it was refused.
pub type Admission = Result<BookingDetails, Rejection>;

pub const BOOKING_SUCCESS_MESSAGE: &str = "Booking successful!";

/// Client-facing summary of an admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingResult {
    pub success: bool,
    pub message: String,
    pub booking: Option<BookingDetails>,
}

impl From<Admission> for BookingResult {
    fn from(admission: Admission) -> Self {
        match admission {
            Ok(details) => BookingResult {
                success: true,
                message: BOOKING_SUCCESS_MESSAGE.to_string(),
                booking: Some(details),
            },
            Err(rejection) => BookingResult {
                success: false,
                message: rejection.message().to_string(),
                booking: None,
            },
        }
    }
}

/// Change records, flat and self-contained. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    EventCreated {
        event: Event,
        slots: Vec<TimeSlot>,
    },
    /// Carries the full merged record.
    EventUpdated {
        event: Event,
    },
    /// Cascades to the event's slots and their bookings.
    EventDeleted {
        id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingCancelled {
        id: Ulid,
        time_slot_id: Ulid,
    },
    /// Overwrites a slot's cached counter (repair or administrative override).
    SlotCounterSet {
        id: Ulid,
        current_bookings: u32,
    },
}
