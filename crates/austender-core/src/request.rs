//! Search requests, normalized match summaries, and the sink seams the
//! engine uses to stream matches into the lake and back to callers.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::window::DateWindow;

/// Identifier of the federal OCDS source, used when none is named.
pub const DEFAULT_SOURCE_ID: &str = "federal";

/// Lowercase and trim a source identifier; empty means the default.
pub fn normalize_source_id(id: &str) -> String {
    let cleaned = id.trim().to_lowercase();
    if cleaned.is_empty() {
        DEFAULT_SOURCE_ID.to_string()
    } else {
        cleaned
    }
}

/// Receives match summaries as a source produces them. Implementations
/// must tolerate concurrent calls from window workers.
pub trait MatchSink: Send + Sync {
    fn write(&self, summary: &MatchSummary);
}

impl<F> MatchSink for F
where
    F: Fn(&MatchSummary) + Send + Sync,
{
    fn write(&self, summary: &MatchSummary) {
        self(summary)
    }
}

/// Progress callback: `(completed_windows, total_windows)`. Invoked
/// monotonically in completion order; skipped windows count as completed.
pub type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Gate letting the cache skip a window whose month is already on disk.
pub type WindowGate = Arc<dyn Fn(&DateWindow) -> bool + Send + Sync>;

/// Immutable query passed by value into every component.
#[derive(Clone, Default)]
pub struct SearchRequest {
    pub keyword: String,
    pub company: String,
    pub agency: String,
    pub source: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub date_type: String,
    pub lookback_period: i32,
    pub verbose: bool,
    /// Filtered matches, with `is_update` set on supersession.
    pub on_match: Option<Arc<dyn MatchSink>>,
    /// Every valued release regardless of filters; feeds the lake.
    pub on_any_match: Option<Arc<dyn MatchSink>>,
    pub on_progress: Option<ProgressFn>,
    pub should_fetch_window: Option<WindowGate>,
}

impl fmt::Debug for SearchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchRequest")
            .field("keyword", &self.keyword)
            .field("company", &self.company)
            .field("agency", &self.agency)
            .field("source", &self.source)
            .field("start_date", &self.start_date)
            .field("end_date", &self.end_date)
            .field("date_type", &self.date_type)
            .field("lookback_period", &self.lookback_period)
            .field("verbose", &self.verbose)
            .finish_non_exhaustive()
    }
}

impl SearchRequest {
    /// True when the gate (if any) wants this window fetched.
    pub fn wants_window(&self, window: &DateWindow) -> bool {
        match &self.should_fetch_window {
            Some(gate) => gate(window),
            None => true,
        }
    }

    pub fn report_progress(&self, completed: usize, total: usize) {
        if let Some(progress) = &self.on_progress {
            progress(completed, total);
        }
    }

    pub fn emit_any_match(&self, summary: &MatchSummary) {
        if let Some(sink) = &self.on_any_match {
            sink.write(summary);
        }
    }

    pub fn emit_match(&self, summary: &MatchSummary) {
        if let Some(sink) = &self.on_match {
            sink.write(summary);
        }
    }
}

/// One normalized contract event produced by a source.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MatchSummary {
    pub source: String,
    pub contract_id: String,
    pub release_id: String,
    pub ocid: String,
    pub supplier: String,
    pub agency: String,
    pub title: String,
    pub amount: Decimal,
    pub release_date: Option<DateTime<Utc>>,
    pub is_update: bool,
}

/// Row-level filter shared by state adapters and lake scans.
///
/// `period_end` is the contract-period end when the listing provides one;
/// contracts still running past the requested end date are kept.
pub fn matches_summary_filters(
    req: &SearchRequest,
    summary: &MatchSummary,
    period_end: Option<DateTime<Utc>>,
) -> bool {
    let keyword = req.keyword.trim().to_lowercase();
    if !keyword.is_empty() {
        let hay = format!(
            "{} {} {} {}",
            summary.contract_id, summary.title, summary.supplier, summary.agency
        )
        .to_lowercase();
        if !hay.contains(&keyword) {
            return false;
        }
    }

    let company = req.company.trim().to_lowercase();
    if !company.is_empty() && !summary.supplier.to_lowercase().contains(&company) {
        return false;
    }

    let agency = req.agency.trim().to_lowercase();
    if !agency.is_empty() && !summary.agency.to_lowercase().contains(&agency) {
        return false;
    }

    if let Some(start) = req.start_date {
        match summary.release_date {
            Some(released) if released >= start => {}
            _ => return false,
        }
    }
    if let Some(end) = req.end_date {
        let upper = period_end.unwrap_or(end);
        if let Some(released) = summary.release_date {
            if released > end && upper > end {
                return false;
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn sample() -> MatchSummary {
        MatchSummary {
            source: DEFAULT_SOURCE_ID.into(),
            contract_id: "CN-1".into(),
            release_id: "rel-1".into(),
            ocid: "ocds-1".into(),
            supplier: "Acme Pty Ltd".into(),
            agency: "ATO".into(),
            title: "Audit and advisory".into(),
            amount: Decimal::from_str("100").unwrap(),
            release_date: Some(utc(2024, 7, 1)),
            is_update: false,
        }
    }

    #[test]
    fn normalizes_source_identifiers() {
        assert_eq!(normalize_source_id(" NSW "), "nsw");
        assert_eq!(normalize_source_id(""), DEFAULT_SOURCE_ID);
        assert_eq!(normalize_source_id("Federal"), DEFAULT_SOURCE_ID);
    }

    #[test]
    fn filters_match_case_insensitively() {
        let summary = sample();
        let hit = |req: SearchRequest| matches_summary_filters(&req, &summary, None);

        assert!(hit(SearchRequest::default()));
        assert!(hit(SearchRequest {
            keyword: "audit".into(),
            ..Default::default()
        }));
        assert!(!hit(SearchRequest {
            keyword: "travel".into(),
            ..Default::default()
        }));
        assert!(hit(SearchRequest {
            company: "acme".into(),
            ..Default::default()
        }));
        assert!(!hit(SearchRequest {
            company: "other".into(),
            ..Default::default()
        }));
        assert!(hit(SearchRequest {
            agency: "ato".into(),
            ..Default::default()
        }));
        assert!(!hit(SearchRequest {
            agency: "dva".into(),
            ..Default::default()
        }));
    }

    #[test]
    fn date_range_bounds_apply() {
        let summary = sample();
        assert!(!matches_summary_filters(
            &SearchRequest {
                start_date: Some(utc(2025, 1, 1)),
                ..Default::default()
            },
            &summary,
            None,
        ));
        assert!(!matches_summary_filters(
            &SearchRequest {
                end_date: Some(utc(2023, 1, 1)),
                ..Default::default()
            },
            &summary,
            None,
        ));
        // A contract period ending inside the range keeps the row even
        // though the release date is past the requested end.
        assert!(matches_summary_filters(
            &SearchRequest {
                end_date: Some(utc(2024, 8, 1)),
                ..Default::default()
            },
            &summary,
            Some(utc(2024, 7, 20)),
        ));
    }

    #[test]
    fn missing_release_date_fails_start_bound_only() {
        let mut summary = sample();
        summary.release_date = None;
        assert!(!matches_summary_filters(
            &SearchRequest {
                start_date: Some(utc(2020, 1, 1)),
                ..Default::default()
            },
            &summary,
            None,
        ));
        assert!(matches_summary_filters(
            &SearchRequest {
                end_date: Some(utc(2020, 1, 1)),
                ..Default::default()
            },
            &summary,
            None,
        ));
    }
}
