use crate::model::Ms;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_ROOMS: usize = 10_000;
pub const MAX_VENUES: usize = 1_000;
pub const MAX_BOOKINGS_PER_ROOM: usize = 100_000;

/// A year of weekly occurrences fits with room to spare.
pub const MAX_BATCH_SIZE: usize = 64;

/// One day. Keeps weekly and monthly occurrences of one batch disjoint.
pub const MAX_DURATION_MINUTES: u32 = 24 * 60;

pub const MAX_HEADCOUNT: u32 = 10_000;
pub const MAX_ATTACHMENT_BYTES: usize = 10 * 1024 * 1024;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
