//! Timestamp utilities
//!
//! Sample times are `f64` seconds since the Unix epoch. At present-day epoch
//! values an `f64` resolves ~0.2 µs, well inside the pipeline's sub-millisecond
//! target. Minute indices are `i64` seconds of the minute's first instant.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};

pub const SECONDS_PER_MINUTE: i64 = 60;

/// Current wall-clock time in epoch seconds
pub fn now_seconds() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + now.timestamp_subsec_nanos() as f64 * 1e-9
}

/// Start of the minute containing `t`
pub fn minute_floor(t: f64) -> i64 {
    (t / SECONDS_PER_MINUTE as f64).floor() as i64 * SECONDS_PER_MINUTE
}

/// Nearest minute boundary to `t`
pub fn minute_round(t: f64) -> i64 {
    (t / SECONDS_PER_MINUTE as f64).round() as i64 * SECONDS_PER_MINUTE
}

/// Minute-of-hour (0..=59) for a minute start
pub fn minute_of_hour(minute_start: i64) -> u32 {
    (minute_start.rem_euclid(3600) / SECONDS_PER_MINUTE) as u32
}

pub fn to_datetime(minute_start: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(minute_start, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// `YYYYMMDD` directory component
pub fn day_component(minute_start: i64) -> String {
    let dt = to_datetime(minute_start);
    format!("{:04}{:02}{:02}", dt.year(), dt.month(), dt.day())
}

/// `HHMM` file stem component
pub fn hhmm_component(minute_start: i64) -> String {
    let dt = to_datetime(minute_start);
    format!("{:02}{:02}", dt.hour(), dt.minute())
}

/// Fields needed to build the broadcast time code for a UTC minute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtcMinuteFields {
    pub year: i32,
    pub day_of_year: u32,
    pub hour: u32,
    pub minute: u32,
}

pub fn utc_fields(minute_start: i64) -> UtcMinuteFields {
    let dt = to_datetime(minute_start);
    UtcMinuteFields {
        year: dt.year(),
        day_of_year: dt.ordinal(),
        hour: dt.hour(),
        minute: dt.minute(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minute_floor_handles_fractional_and_negative() {
        assert_eq!(minute_floor(119.999), 60);
        assert_eq!(minute_floor(120.0), 120);
        assert_eq!(minute_floor(-0.5), -60);
    }

    #[test]
    fn test_minute_round() {
        assert_eq!(minute_round(119.6), 120);
        assert_eq!(minute_round(89.0), 60);
    }

    #[test]
    fn test_minute_of_hour() {
        // 2024-03-01 12:44:00 UTC
        let t = 1_709_297_040;
        assert_eq!(minute_of_hour(t), 44);
        assert_eq!(hhmm_component(t), "1244");
        assert_eq!(day_component(t), "20240301");
    }

    #[test]
    fn test_utc_fields() {
        let f = utc_fields(1_709_297_040);
        assert_eq!(f.year, 2024);
        assert_eq!(f.day_of_year, 61);
        assert_eq!(f.hour, 12);
        assert_eq!(f.minute, 44);
    }

    #[test]
    fn test_now_is_recent() {
        let now = now_seconds();
        assert!(now > 946_684_800.0);
        assert!(now < 4_102_444_800.0);
    }
}
