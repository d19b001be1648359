// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Shared helpers for date/time formatting.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

/// Format a UTC timestamp as RFC3339 using a `Z` suffix.
///
/// Stored timestamps always use this form so that string comparison in SQL
/// matches chronological order.
pub fn format_utc_rfc3339(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse an RFC3339 instant (any offset) into UTC.
pub fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Format a calendar date for FHIR `date` search parameters (`YYYY-MM-DD`).
pub fn format_search_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_uses_z_suffix() {
        let dt = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
        assert_eq!(format_utc_rfc3339(dt), "2026-03-01T09:30:00Z");
    }

    #[test]
    fn test_parse_instant_normalizes_offset() {
        let parsed = parse_instant("2026-03-01T10:30:00+01:00").unwrap();
        assert_eq!(format_utc_rfc3339(parsed), "2026-03-01T09:30:00Z");
        assert!(parse_instant("not-a-date").is_none());
    }
}
