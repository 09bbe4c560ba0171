use crate::model::Ms;

pub const HOUR_MS: Ms = 3_600_000;

/// Bookings cannot be cancelled when the session starts in less than this.
pub const CANCELLATION_WINDOW_MS: Ms = 2 * HOUR_MS;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single session may not run longer than a day.
pub const MAX_SLOT_DURATION_MS: Ms = 24 * HOUR_MS;

pub const MAX_SUBJECT_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 4_000;
pub const MAX_NAME_LEN: usize = 200;
pub const MAX_EMAIL_LEN: usize = 320;

pub const MAX_CAPACITY: u32 = 1_000;
pub const MAX_SLOTS: usize = 1_000_000;
pub const MAX_USERS: usize = 1_000_000;
