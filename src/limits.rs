//! Hard input limits. Requests beyond these are rejected before they reach
//! the registry lock.

pub const MAX_CLIENT_ID_LEN: usize = 128;
pub const MAX_PHONE_LEN: usize = 32;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_SERVICES_PER_RESERVATION: usize = 16;
pub const MAX_SERVICE_NAME_LEN: usize = 64;

/// Upper bound on stored reservations (active + cancelled history).
pub const MAX_RESERVATIONS: usize = 1_000_000;

/// How far ahead of today a slot may be booked.
pub const MAX_BOOKING_HORIZON_DAYS: u64 = 366;

/// Largest accepted total, in cents.
pub const MAX_TOTAL_CENTS: i64 = 100_000_000;

/// Queued notifications before new ones are dropped.
pub const NOTIFICATION_QUEUE_CAPACITY: usize = 1024;
