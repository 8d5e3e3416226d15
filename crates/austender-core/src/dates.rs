//! Date parsing, range resolution, and partition-label helpers.

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveTime, TimeZone, Utc};

use crate::error::CollectError;

/// Parse a user-supplied date flag. Accepts RFC3339 or `YYYY-MM-DD`;
/// empty input means "not supplied".
pub fn parse_date_input(raw: &str) -> Result<Option<DateTime<Utc>>, CollectError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }
    if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(Some(Utc.from_utc_datetime(&parsed.and_time(NaiveTime::MIN))));
    }
    Err(CollectError::InvalidArgument(format!(
        "invalid date {trimmed:?}"
    )))
}

/// Resolve the effective fetch range: end defaults to now, start defaults
/// to `lookback_years` before end, and inverted ranges are swapped.
pub fn resolve_dates(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    lookback_years: i32,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let years = if lookback_years > 0 {
        lookback_years
    } else {
        crate::DEFAULT_LOOKBACK_PERIOD
    };
    let end_utc = end.unwrap_or_else(Utc::now);
    let start_utc = start.unwrap_or_else(|| {
        end_utc
            .checked_sub_months(Months::new(12 * years as u32))
            .unwrap_or(end_utc)
    });
    if start_utc > end_utc {
        (end_utc, start_utc)
    } else {
        (start_utc, end_utc)
    }
}

/// Fail early on a CLI range supplied in the wrong order.
pub fn validate_date_order(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<(), CollectError> {
    if let (Some(s), Some(e)) = (start, end) {
        if s > e {
            return Err(CollectError::InvalidArgument(
                "start date cannot be after end date".into(),
            ));
        }
    }
    Ok(())
}

/// Australian financial-year partition label, `fy=YYYY-YY` (July-June).
pub fn financial_year_label(ts: DateTime<Utc>) -> String {
    let mut year = ts.year();
    if ts.month() < 7 {
        year -= 1;
    }
    format!("fy={}-{:02}", year, (year + 1) % 100)
}

/// Month partition label, `month=YYYY-MM`.
pub fn month_label(ts: DateTime<Utc>) -> String {
    format!("month={}", ts.format("%Y-%m"))
}

/// Normalize a partition path component: lowercase, spaces to
/// underscores, everything outside `[a-z0-9_-]` stripped. Whitespace-only
/// and empty inputs map to `unknown`.
pub fn sanitize_partition_component(raw: &str) -> String {
    let sanitized: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' { '_' } else { c })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect();
    if sanitized.is_empty() {
        "unknown".to_string()
    } else {
        sanitized
    }
}
