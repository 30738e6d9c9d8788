//! Date and cut-label normalisation for temporal attributes

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%Y%m%d"];

/// Normalise a date, datetime or cut label to the form the platform accepts.
///
/// Timestamps without an offset are taken as UTC. Cut labels
/// (`2024-01-31NLondonClose`) and anything unparseable pass through untouched.
pub fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();

    if is_cut_label(trimmed) {
        return trimmed.to_string();
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return format_utc(dt.with_timezone(&Utc));
    }

    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return format_utc(dt.and_utc());
        }
    }

    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, fmt) {
            if let Some(dt) = date.and_hms_opt(0, 0, 0) {
                return format_utc(dt.and_utc());
            }
        }
    }

    trimmed.to_string()
}

fn format_utc(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// `YYYY-MM-DD` followed by `N` and a cut name
fn is_cut_label(value: &str) -> bool {
    match (value.get(..10), value.get(10..11)) {
        (Some(date), Some("N")) => {
            value.len() > 11 && NaiveDate::parse_from_str(date, "%Y-%m-%d").is_ok()
        }
        _ => false,
    }
}
