//! Shared row parsing and validation.
//!
//! Timestamp and coordinate parsing used by the aggregator. Rows that
//! fail these checks are dropped, never fatal.

use chrono::{Datelike as _, Duration, NaiveDate, NaiveDateTime, NaiveTime};

/// Timestamp formats seen across municipal open-data exports, tried in
/// order.
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];

/// Parses an event timestamp. Returns `None` for anything unparsable.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    for format in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(parsed);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(raw, format) {
            return Some(parsed.and_time(NaiveTime::MIN));
        }
    }
    None
}

/// Parses and validates a coordinate pair.
///
/// Returns `None` for missing or non-numeric fields, out-of-range values
/// (outside +-90 / +-180), and the (0, 0) / (-1, -1) placeholders that
/// mark known bad geocodes in the source systems.
#[must_use]
#[allow(clippy::float_cmp)]
pub fn parse_coordinates(lat_raw: &str, lon_raw: &str) -> Option<(f64, f64)> {
    let lat = lat_raw.trim().parse::<f64>().ok()?;
    let lon = lon_raw.trim().parse::<f64>().ok()?;
    if !lat.is_finite() || !lon.is_finite() {
        return None;
    }
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return None;
    }
    if (lat == 0.0 && lon == 0.0) || (lat == -1.0 && lon == -1.0) {
        return None;
    }
    Some((lat, lon))
}

/// The Sunday ending the right-closed calendar week containing `date`.
///
/// A Sunday maps to itself; a Monday maps to the following Sunday.
#[must_use]
pub fn week_ending(date: NaiveDate) -> NaiveDate {
    let days_to_sunday = 6 - i64::from(date.weekday().num_days_from_monday());
    date + Duration::days(days_to_sunday)
}
