pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 1000;
/// Creator and attendee names.
pub const MAX_PERSON_NAME_LEN: usize = 100;
pub const MAX_EMAIL_LEN: usize = 254;

pub const MIN_BOOKINGS_PER_SLOT: u32 = 1;
pub const MAX_BOOKINGS_PER_SLOT: u32 = 100;
pub const MAX_SLOTS_PER_EVENT: usize = 500;

/// Upper bound on the raw `time_slots` JSON accepted in one INSERT.
pub const MAX_SLOTS_JSON_LEN: usize = 256 * 1024;
