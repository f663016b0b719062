//! Display formatting for trip figures.
//!
//! Timestamps are rendered in UTC; hosts that want local time convert before
//! display or use their own platform formatter.

use chrono::{DateTime, Utc};

/// Format a duration as `HH:MM:SS`. Hours are not wrapped at 24.
pub fn format_duration(duration_ms: i64) -> String {
    let total_seconds = duration_ms.max(0) / 1000;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds / 60) % 60;
    let seconds = total_seconds % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

/// Format a distance with two decimals, e.g. `"12.35 km"`.
pub fn format_distance_km(distance_km: f64) -> String {
    format!("{:.2} km", distance_km)
}

fn utc(timestamp_ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(timestamp_ms)
}

/// `"Dec 31, 2025 10:30 AM"`. Empty for timestamps chrono cannot represent.
pub fn format_date_time(timestamp_ms: i64) -> String {
    utc(timestamp_ms)
        .map(|t| t.format("%b %d, %Y %I:%M %p").to_string())
        .unwrap_or_default()
}

/// `"Dec 31, 2025"`
pub fn format_date(timestamp_ms: i64) -> String {
    utc(timestamp_ms)
        .map(|t| t.format("%b %d, %Y").to_string())
        .unwrap_or_default()
}

/// `"10:30 AM"`
pub fn format_time(timestamp_ms: i64) -> String {
    utc(timestamp_ms)
        .map(|t| t.format("%I:%M %p").to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2025-12-31T10:30:00Z
    const NEW_YEARS_EVE: i64 = 1_767_177_000_000;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "00:00:00");
        assert_eq!(format_duration(5_000), "00:00:05");
        assert_eq!(format_duration(5_025_999), "01:23:45");
        assert_eq!(format_duration(100 * 3_600_000), "100:00:00");
    }

    #[test]
    fn test_negative_duration_clamped() {
        assert_eq!(format_duration(-1_000), "00:00:00");
    }

    #[test]
    fn test_format_distance() {
        assert_eq!(format_distance_km(0.0), "0.00 km");
        assert_eq!(format_distance_km(0.11119), "0.11 km");
        assert_eq!(format_distance_km(12.345_6), "12.35 km");
    }

    #[test]
    fn test_format_timestamps() {
        assert_eq!(format_date_time(NEW_YEARS_EVE), "Dec 31, 2025 10:30 AM");
        assert_eq!(format_date(NEW_YEARS_EVE), "Dec 31, 2025");
        assert_eq!(format_time(NEW_YEARS_EVE + 6 * 3_600_000), "04:30 PM");
    }

    #[test]
    fn test_unrepresentable_timestamp() {
        assert_eq!(format_date_time(i64::MAX), "");
    }
}
