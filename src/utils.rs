//! Utility functions for the smart-bottle-ble crate.
//!
//! Timestamp handling for telemetry frames. The peripheral stamps each frame
//! with its local wall-clock time, which the host interprets in its own
//! local time zone.

use chrono::{DateTime, Duration, Local, LocalResult, NaiveDateTime, TimeZone, Utc};

use crate::error::{Error, Result};

/// Format of the `ts` field sent by the peripheral.
pub const DEVICE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Format used for [`TelemetryRecord::display_timestamp`](crate::TelemetryRecord).
pub const DISPLAY_TIMESTAMP_FORMAT: &str = "%d %b %Y, %I:%M %p";

/// Parse a device timestamp (`yyyy-MM-dd HH:mm:ss`, local time) into epoch seconds.
///
/// Ambiguous local times resolve to the earlier instant. Local times that
/// fall into a DST gap are moved forward by one hour.
///
/// # Example
///
/// ```
/// use smart_bottle_ble::utils::{epoch_to_display, parse_device_timestamp};
///
/// let epoch = parse_device_timestamp("2024-01-01 10:00:00").unwrap();
/// assert_eq!(epoch_to_display(epoch).unwrap(), "01 Jan 2024, 10:00 AM");
/// ```
pub fn parse_device_timestamp(ts: &str) -> Result<i64> {
    let naive = NaiveDateTime::parse_from_str(ts.trim(), DEVICE_TIMESTAMP_FORMAT).map_err(|e| {
        Error::FrameParse {
            context: format!("bad timestamp {:?}: {}", ts, e),
        }
    })?;

    let local = match Local.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => Local
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .ok_or_else(|| Error::FrameParse {
                context: format!("timestamp {:?} does not exist in the local time zone", ts),
            })?,
    };

    Ok(local.timestamp())
}

/// Render epoch seconds as a local display string (`dd MMM yyyy, hh:mm a`).
pub fn epoch_to_display(epoch_seconds: i64) -> Result<String> {
    let utc: DateTime<Utc> =
        DateTime::from_timestamp(epoch_seconds, 0).ok_or_else(|| Error::FrameParse {
            context: format!("epoch {} out of range", epoch_seconds),
        })?;

    Ok(utc
        .with_timezone(&Local)
        .format(DISPLAY_TIMESTAMP_FORMAT)
        .to_string())
}

/// Current wall-clock time in epoch seconds.
#[inline]
pub fn epoch_seconds_now() -> i64 {
    Utc::now().timestamp()
}

/// Convert Celsius to Fahrenheit.
///
/// # Example
///
/// ```
/// use smart_bottle_ble::celsius_to_fahrenheit;
///
/// assert!((celsius_to_fahrenheit(100.0) - 212.0).abs() < 0.001);
/// ```
#[inline]
pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_matches_local_zone() {
        let epoch = parse_device_timestamp("2024-01-01 10:00:00").unwrap();
        let naive =
            NaiveDateTime::parse_from_str("2024-01-01 10:00:00", DEVICE_TIMESTAMP_FORMAT).unwrap();
        let expected = Local.from_local_datetime(&naive).earliest().unwrap();
        assert_eq!(epoch, expected.timestamp());
    }

    #[test]
    fn test_display_roundtrip() {
        let epoch = parse_device_timestamp("2024-01-01 10:00:00").unwrap();
        assert_eq!(epoch_to_display(epoch).unwrap(), "01 Jan 2024, 10:00 AM");

        let epoch = parse_device_timestamp("2023-12-31 23:05:09").unwrap();
        assert_eq!(epoch_to_display(epoch).unwrap(), "31 Dec 2023, 11:05 PM");
    }

    #[test]
    fn test_parse_rejects_other_formats() {
        assert!(parse_device_timestamp("2024-01-01T10:00:00").is_err());
        assert!(parse_device_timestamp("01/01/2024 10:00").is_err());
        assert!(parse_device_timestamp("").is_err());
        assert!(parse_device_timestamp("2024-13-01 10:00:00").is_err());
    }

    #[test]
    fn test_celsius_to_fahrenheit() {
        assert!((celsius_to_fahrenheit(0.0) - 32.0).abs() < 0.001);
        assert!((celsius_to_fahrenheit(37.0) - 98.6).abs() < 0.001);
    }

    #[test]
    fn test_epoch_seconds_now_is_recent() {
        // 2024-01-01T00:00:00Z
        assert!(epoch_seconds_now() > 1_704_067_200);
    }
}
