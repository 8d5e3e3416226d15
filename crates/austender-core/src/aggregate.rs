//! Contract-keyed aggregation: one entry per canonical contract id, the
//! release with the latest date wins.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::request::{matches_summary_filters, normalize_source_id, MatchSummary, SearchRequest};

/// Latest value observed for a single canonical contract.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContractAggregate {
    pub value: Decimal,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Accumulates summaries for one source run. Arrival order does not
/// matter: replacement depends only on the release date, so merging is
/// commutative across windows.
pub struct ContractAggregator {
    filters: SearchRequest,
    aggregates: HashMap<String, ContractAggregate>,
}

impl ContractAggregator {
    pub fn new(req: &SearchRequest) -> Self {
        let mut filters = req.clone();
        filters.source = normalize_source_id(&req.source);
        Self {
            filters,
            aggregates: HashMap::new(),
        }
    }

    pub fn process(&mut self, summary: MatchSummary) {
        let matches = matches_summary_filters(&self.filters, &summary, None);
        self.process_with_match(summary, matches);
    }

    /// Variant for sources whose filter needs context beyond the summary
    /// (the federal keyword haystack spans ocid and tender text).
    pub fn process_with_match(&mut self, mut summary: MatchSummary, matches_filters: bool) {
        // The lake sink sees every valued release, filtered or not.
        self.filters.emit_any_match(&summary);

        if !matches_filters {
            return;
        }

        if let Some(existing) = self.aggregates.get(&summary.contract_id) {
            // Strict comparison: equal release dates keep the first
            // observed release.
            if summary.release_date <= existing.updated_at {
                return;
            }
            summary.is_update = true;
        }
        self.aggregates.insert(
            summary.contract_id.clone(),
            ContractAggregate {
                value: summary.amount,
                updated_at: summary.release_date,
            },
        );
        self.filters.emit_match(&summary);
    }

    pub fn total(&self) -> Decimal {
        self.aggregates.values().map(|agg| agg.value).sum()
    }

    pub fn len(&self) -> usize {
        self.aggregates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aggregates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;
    use std::sync::{Arc, Mutex};

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn release(id: &str, amount: &str, date: DateTime<Utc>) -> MatchSummary {
        MatchSummary {
            source: "federal".into(),
            contract_id: id.into(),
            release_id: format!("{id}-{date}"),
            ocid: id.into(),
            supplier: "Acme".into(),
            agency: "ATO".into(),
            title: "Services".into(),
            amount: dec(amount),
            release_date: Some(date),
            is_update: false,
        }
    }

    #[test]
    fn latest_release_wins_per_contract() {
        let mut agg = ContractAggregator::new(&SearchRequest::default());
        agg.process(release("CN123", "100", utc(2024, 1, 1)));
        agg.process(release("CN123", "150", utc(2024, 2, 1)));
        agg.process(release("CN999", "10", utc(2024, 2, 1)));
        assert_eq!(agg.total(), dec("160"));
        assert_eq!(agg.len(), 2);
    }

    #[test]
    fn arrival_order_does_not_matter() {
        let dates = [utc(2024, 3, 1), utc(2024, 1, 1), utc(2024, 2, 1)];
        let amounts = ["300", "100", "200"];

        for perm in [[0, 1, 2], [2, 1, 0], [1, 0, 2], [1, 2, 0], [2, 0, 1], [0, 2, 1]] {
            let mut agg = ContractAggregator::new(&SearchRequest::default());
            for i in perm {
                agg.process(release("CN1", amounts[i], dates[i]));
            }
            assert_eq!(agg.total(), dec("300"));
        }
    }

    #[test]
    fn equal_dates_keep_first_observed() {
        let mut agg = ContractAggregator::new(&SearchRequest::default());
        agg.process(release("CN1", "100", utc(2024, 1, 1)));
        agg.process(release("CN1", "999", utc(2024, 1, 1)));
        assert_eq!(agg.total(), dec("100"));
    }

    #[test]
    fn supersession_emits_update_flag() {
        let seen: Arc<Mutex<Vec<(String, bool)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            move |summary: &MatchSummary| {
                seen.lock()
                    .unwrap()
                    .push((summary.contract_id.clone(), summary.is_update));
            }
        };
        let req = SearchRequest {
            on_match: Some(Arc::new(sink)),
            ..Default::default()
        };

        let mut agg = ContractAggregator::new(&req);
        agg.process(release("CN1", "100", utc(2024, 1, 1)));
        agg.process(release("CN1", "150", utc(2024, 2, 1)));
        agg.process(release("CN1", "90", utc(2023, 12, 1)));

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![("CN1".to_string(), false), ("CN1".to_string(), true)]
        );
    }

    #[test]
    fn any_match_sink_sees_filtered_out_rows() {
        let all = Arc::new(Mutex::new(0usize));
        let sink = {
            let all = Arc::clone(&all);
            move |_: &MatchSummary| *all.lock().unwrap() += 1
        };
        let req = SearchRequest {
            company: "nonexistent".into(),
            on_any_match: Some(Arc::new(sink)),
            ..Default::default()
        };

        let mut agg = ContractAggregator::new(&req);
        agg.process(release("CN1", "100", utc(2024, 1, 1)));
        assert_eq!(*all.lock().unwrap(), 1);
        assert_eq!(agg.total(), Decimal::ZERO);
    }
}
