use time::OffsetDateTime;

/// One day in milliseconds; the credit refill period.
pub const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Current wall-clock time as epoch milliseconds.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
