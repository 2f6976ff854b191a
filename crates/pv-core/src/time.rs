//! # UTC instants and ranges
//!
//! Every bound is an instant in UTC. An offset in the input is honoured and
//! converted; input without an offset is read as UTC, never as local time.

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

/// Offset-free layouts accepted after RFC 3339, read as UTC.
const NAIVE_FORMATS: [&str; 3] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

/// Parse an ISO-8601 / RFC 3339 timestamp into a UTC instant.
pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Like [`parse_instant`], but reports which parameter was malformed.
pub fn require_instant(param: &str, raw: &str) -> CoreResult<DateTime<Utc>> {
    parse_instant(raw).ok_or_else(|| {
        let msg = format!("{} is not an ISO-8601 timestamp: '{}'", param, raw);
        CoreError::InvalidParameter(msg)
    })
}

/// Render an instant the way it is written into query filters.
pub fn format_instant(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Optional `[from, to]` window. The raw strings are kept so cache keys
/// reflect exactly what the caller sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeRange {
    from: Option<(String, DateTime<Utc>)>,
    to: Option<(String, DateTime<Utc>)>,
}

impl TimeRange {
    /// No range filtering at all.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Parse optional bounds. Blank strings count as absent.
    ///
    /// `from <= to` is deliberately not checked here.
    pub fn parse(from: Option<&str>, to: Option<&str>) -> CoreResult<Self> {
        let parse_bound = |param: &str, raw: Option<&str>| -> CoreResult<_> {
            match raw.map(str::trim).filter(|s| !s.is_empty()) {
                Some(s) => Ok(Some((s.to_string(), require_instant(param, s)?))),
                None => Ok(None),
            }
        };
        Ok(Self {
            from: parse_bound("from", from)?,
            to: parse_bound("to", to)?,
        })
    }

    /// Both bounds, or `None` when either is missing.
    pub fn bounds(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match (&self.from, &self.to) {
            (Some((_, from)), Some((_, to))) => Some((*from, *to)),
            _ => None,
        }
    }

    pub fn raw_from(&self) -> Option<&str> {
        self.from.as_ref().map(|(raw, _)| raw.as_str())
    }

    pub fn raw_to(&self) -> Option<&str> {
        self.to.as_ref().map(|(raw, _)| raw.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_offset_is_converted_to_utc() {
        let dt = parse_instant("2024-01-01T02:00:00+02:00").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_naive_input_is_read_as_utc() {
        let dt = parse_instant("2024-01-01T00:00:00").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let day = parse_instant("2024-03-05").unwrap();
        assert_eq!(day, Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(parse_instant("yesterday").is_none());
        assert!(matches!(
            require_instant("from", "yesterday"),
            Err(CoreError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_format_uses_millis_and_z() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(format_instant(&dt), "2024-01-02T03:04:05.000Z");
    }

    #[test]
    fn test_half_open_range_disables_filtering() {
        let range = TimeRange::parse(Some("2024-01-01T00:00:00Z"), None).unwrap();
        assert!(range.bounds().is_none());
        assert_eq!(range.raw_from(), Some("2024-01-01T00:00:00Z"));

        let blank = TimeRange::parse(Some("  "), Some("")).unwrap();
        assert_eq!(blank, TimeRange::unbounded());
    }

    #[test]
    fn test_inverted_range_is_not_rejected() {
        let range = TimeRange::parse(Some("2024-02-01"), Some("2024-01-01")).unwrap();
        let (from, to) = range.bounds().unwrap();
        assert!(from > to);
    }
}
