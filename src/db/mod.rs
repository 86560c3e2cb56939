mod aggregates;
mod connection;
mod findings;
mod migrations;
mod repository;
mod runs;
mod schema;
mod settings;
mod text_index;
mod topics;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::Row;

pub use repository::Repository;
pub use schema::LATEST_VERSION;
pub use settings::{DAILY_BUDGET, DEFAULT_DAILY_BUDGET, DELIVERY_CHANNEL};
pub use text_index::{Fts5Index, IndexedText, TextIndex};

/// Fixed-width UTC text, so comparing stored strings compares instants.
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub(crate) fn encode_time(dt: &DateTime<Utc>) -> String {
    dt.format(TIME_FORMAT).to_string()
}

/// Start of `day` (UTC) in stored form.
pub(crate) fn encode_day(day: NaiveDate) -> String {
    encode_time(&day.and_time(chrono::NaiveTime::MIN).and_utc())
}

pub(crate) fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    // Try RFC3339 first (our own format, e.g. "2026-01-11T12:34:56.000000Z")
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // SQLite datetime('now') format (e.g., "2026-01-11 12:34:56")
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

pub(crate) fn time_column(row: &Row, name: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(name)?;
    parse_datetime(&raw).ok_or_else(|| bad_time(name, raw))
}

pub(crate) fn opt_time_column(row: &Row, name: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(name)? {
        Some(raw) => parse_datetime(&raw).map(Some).ok_or_else(|| bad_time(name, raw)),
        None => Ok(None),
    }
}

fn bad_time(name: &str, raw: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        Type::Text,
        format!("column {name}: unparseable timestamp {raw:?}").into(),
    )
}


#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn stored_times_sort_as_instants() {
        let a = Utc.with_ymd_and_hms(2026, 1, 9, 23, 59, 59).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        assert!(encode_time(&a) < encode_time(&b));
        assert!(encode_time(&a) < encode_day(b.date_naive()));
        assert_eq!(encode_day(b.date_naive()), encode_time(&b));
    }

    #[test]
    fn parses_both_stored_formats() {
        let t = Utc.with_ymd_and_hms(2026, 1, 11, 12, 34, 56).unwrap();
        assert_eq!(parse_datetime(&encode_time(&t)), Some(t));
        assert_eq!(parse_datetime("2026-01-11 12:34:56"), Some(t));
        assert_eq!(parse_datetime("yesterday"), None);
    }
}
