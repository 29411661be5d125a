/// Longest rental a single booking or hold may cover, in days.
pub const MAX_RENTAL_DAYS: i64 = 366;

/// Max cars in one `list_available` candidate pool.
pub const MAX_CANDIDATE_POOL: usize = 10_000;

/// Max live holds tracked on one car.
pub const MAX_HOLDS_PER_CAR: usize = 1_000;

/// Max bookings retained on one car.
pub const MAX_BOOKINGS_PER_CAR: usize = 100_000;

/// Max registered cars per engine.
pub const MAX_CARS: usize = 1_000_000;

/// Max hold time-to-live accepted from callers, in minutes.
pub const MAX_HOLD_TTL_MINUTES: i64 = 24 * 60;

/// Upper bound on a single encoded WAL record. Anything larger is treated as corruption.
pub const MAX_WAL_RECORD_BYTES: usize = 1 << 20;

/// How long an expired hold's id is remembered after its expiry, in hours.
pub const LAPSED_HOLD_RETENTION_HOURS: i64 = 24;

/// Max expired holds remembered per car.
pub const MAX_LAPSED_HOLDS_PER_CAR: usize = 10_000;
