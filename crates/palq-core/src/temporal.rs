//! Timestamp parsing and due-time arithmetic. Nothing here fails; unusable
//! input yields `None`.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};

use crate::Cell;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];

/// Reads a timestamp out of a cell. Naive values are taken as UTC.
pub fn parse_timestamp(cell: &Cell) -> Option<DateTime<Utc>> {
    match cell {
        Cell::DateTime(ts) => Some(*ts),
        Cell::Text(raw) => parse_timestamp_str(raw),
        Cell::Empty | Cell::Bool(_) | Cell::Number(_) => None,
    }
}

pub fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    DATE_FORMATS.iter().find_map(|fmt| {
        NaiveDate::parse_from_str(raw, fmt)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
    })
}

/// Signed hours from `now` until `due`, rounded to two decimals. Negative
/// means overdue.
pub fn hours_until(due: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let hours = (due - now).num_milliseconds() as f64 / 3_600_000.0;
    let rounded = (hours * 100.0).round() / 100.0;
    // keep -0.0 out of the table
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

/// True once strictly more than `ttl` has passed since `anchor`.
pub fn ttl_expired(anchor: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    now - anchor > ttl
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, h, m, 0).single().unwrap()
    }

    #[test]
    fn parses_common_export_formats() {
        let expected = at(14, 30);
        for raw in [
            "2026-10-19T14:30:00Z",
            "2026-10-19T16:30:00+02:00",
            "2026-10-19 14:30:00",
            "2026-10-19 14:30",
            "10/19/2026 14:30",
        ] {
            assert_eq!(parse_timestamp_str(raw), Some(expected), "{raw}");
        }
        assert_eq!(parse_timestamp_str("2026-10-19"), Some(at(0, 0)));
    }

    #[test]
    fn garbage_and_non_text_cells_do_not_parse() {
        assert_eq!(parse_timestamp_str("soon"), None);
        assert_eq!(parse_timestamp(&Cell::Empty), None);
        assert_eq!(parse_timestamp(&Cell::Number(45_000.0)), None);
        assert_eq!(parse_timestamp(&Cell::DateTime(at(1, 0))), Some(at(1, 0)));
    }

    #[test]
    fn hours_until_is_signed_and_rounded() {
        assert_eq!(hours_until(at(12, 0), at(10, 0)), 2.0);
        assert_eq!(hours_until(at(9, 0), at(10, 0)), -1.0);
        assert_eq!(hours_until(at(10, 20), at(10, 0)), 0.33);
    }

    #[test]
    fn ttl_is_exclusive_at_the_boundary() {
        let ttl = Duration::minutes(30);
        assert!(!ttl_expired(at(10, 0), at(10, 30), ttl));
        assert!(ttl_expired(at(10, 0), at(10, 31), ttl));
    }
}
