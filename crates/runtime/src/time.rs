//! UTC-naive timestamp helpers.
//!
//! Persisted timestamps are UTC without timezone suffix, matching the
//! relational schema's TEXT columns.

use chrono::{NaiveDateTime, Utc};

const STORAGE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Current wall-clock time as a UTC-naive value.
pub fn utc_now_naive() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// Render a timestamp for storage.
pub fn format_timestamp(value: NaiveDateTime) -> String {
    value.format(STORAGE_FORMAT).to_string()
}

/// Parse a stored timestamp; falls back to epoch on malformed input rather
/// than failing a whole row read.
pub fn parse_timestamp(raw: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(raw, STORAGE_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .unwrap_or(NaiveDateTime::UNIX_EPOCH)
}
