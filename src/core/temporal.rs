//! Timestamp and date parsing shared by the model engine, the query grammar and the stores
//!
//! Persisted documents carry timestamps as extended JSON (`{"$date": "<rfc3339>"}`) so both
//! the in-memory engine and the MongoDB driver compare them as instants, not as strings.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Value, json};

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", "%d-%m-%Y", "%Y.%m.%d", "%d.%m.%Y", "%Y/%m/%d", "%d/%m/%Y",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

/// Parse a calendar date in any of the accepted layouts
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

/// Parse an instant; naive datetimes and bare dates are taken as UTC
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Some(naive) = DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
    {
        return Some(naive.and_utc());
    }
    parse_date(s).and_then(|d| d.and_hms_opt(0, 0, 0)).map(|n| n.and_utc())
}

/// Read an instant out of any representation the chassis produces
///
/// Accepts RFC 3339 / ISO strings, bare dates, `{"$date": ...}` wrappers (string or
/// `$numberLong` milliseconds) and unix seconds.
pub fn timestamp_of(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_datetime(s),
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .or_else(|| {
                n.as_f64()
                    .and_then(|f| DateTime::from_timestamp_millis((f * 1000.0) as i64))
            }),
        Value::Object(map) => match map.get("$date")? {
            Value::String(s) => parse_datetime(s),
            Value::Number(ms) => ms.as_i64().and_then(DateTime::from_timestamp_millis),
            Value::Object(inner) => inner
                .get("$numberLong")
                .and_then(Value::as_str)
                .and_then(|ms| ms.parse::<i64>().ok())
                .and_then(DateTime::from_timestamp_millis),
            _ => None,
        },
        _ => None,
    }
}

/// Canonical string form used on the wire
pub fn to_rfc3339(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Extended-JSON form used inside store documents
pub fn store_date(dt: &DateTime<Utc>) -> Value {
    json!({ "$date": to_rfc3339(dt) })
}

/// Whether a value is an extended-JSON date wrapper
pub fn is_store_date(value: &Value) -> bool {
    matches!(value, Value::Object(map) if map.len() == 1 && map.contains_key("$date"))
}

/// Current instant truncated to the millisecond precision stores keep
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}
