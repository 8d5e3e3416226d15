//! Core domain model for the AusTender collector: search requests, match
//! summaries, money and date utilities, date windowing, and the
//! latest-release-wins contract aggregator.

pub mod aggregate;
pub mod dates;
pub mod error;
pub mod money;
pub mod request;
pub mod window;

pub use aggregate::{ContractAggregate, ContractAggregator};
pub use error::CollectError;
pub use request::{
    matches_summary_filters, normalize_source_id, MatchSink, MatchSummary, ProgressFn,
    SearchRequest, WindowGate, DEFAULT_SOURCE_ID,
};
pub use window::{split_date_windows, DateWindow, MAX_WINDOW_DAYS};

/// OCDS date field used when a request does not name one.
pub const DEFAULT_DATE_TYPE: &str = "contractPublished";

/// Years of history fetched when neither a start date nor a lookback
/// period is supplied.
pub const DEFAULT_LOOKBACK_PERIOD: i32 = 20;
