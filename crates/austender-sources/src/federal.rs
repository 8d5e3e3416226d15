//! Federal OCDS API client: windowed concurrent fetch of contract
//! releases with amendment-aware value extraction.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use austender_core::dates::resolve_dates;
use austender_core::window::default_concurrency;
use austender_core::{
    split_date_windows, CollectError, ContractAggregator, DateWindow, MatchSummary, SearchRequest,
    DEFAULT_DATE_TYPE, DEFAULT_SOURCE_ID, MAX_WINDOW_DAYS,
};
use austender_core::money::format_money;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use austender_store::{HttpClientConfig, HttpFetcher};

use crate::registry::{Source, SourceOptions};

pub const DEFAULT_OCDS_BASE_URL: &str = "https://api.tenders.gov.au/ocds";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OcdsResponse {
    pub releases: Vec<OcdsRelease>,
    pub links: OcdsLinks,
    #[serde(rename = "errorCode")]
    pub error_code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OcdsLinks {
    pub next: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OcdsRelease {
    pub id: String,
    pub ocid: String,
    pub date: String,
    pub tag: Vec<String>,
    pub parties: Vec<OcdsParty>,
    pub contracts: Vec<OcdsContract>,
    pub tender: Option<OcdsTender>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OcdsParty {
    pub name: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OcdsTender {
    pub description: String,
    #[serde(rename = "procurementMethodDetails")]
    pub procurement_method_details: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OcdsContract {
    pub id: String,
    pub title: String,
    pub description: String,
    pub value: Option<OcdsValue>,
    pub amendments: Vec<OcdsAmendment>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OcdsValue {
    pub amount: Decimal,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OcdsAmendment {
    pub id: String,
    #[serde(rename = "amendedvalue")]
    pub amended_value: Decimal,
    #[serde(rename = "contractamendmentvalue")]
    pub contract_amendment_value: Decimal,
}

pub struct FederalSource {
    fetcher: Arc<HttpFetcher>,
    base_url: String,
    max_concurrency: usize,
}

impl FederalSource {
    pub fn new(options: &SourceOptions) -> Result<Self, CollectError> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: options.request_timeout,
            ..Default::default()
        })?;
        Ok(Self {
            fetcher: Arc::new(fetcher),
            base_url: options.ocds_base_url.trim_end_matches('/').to_string(),
            max_concurrency: default_concurrency(),
        })
    }

    fn initial_url(&self, date_type: &str, window: &DateWindow) -> String {
        format!(
            "{}/findByDates/{}/{}/{}",
            self.base_url,
            date_type,
            window.start.to_rfc3339_opts(SecondsFormat::Secs, true),
            window.end.to_rfc3339_opts(SecondsFormat::Secs, true),
        )
    }
}

#[async_trait]
impl Source for FederalSource {
    fn id(&self) -> &'static str {
        DEFAULT_SOURCE_ID
    }

    async fn run(&self, req: &SearchRequest) -> Result<String, CollectError> {
        let (start, end) = resolve_dates(req.start_date, req.end_date, req.lookback_period);
        let date_type = if req.date_type.trim().is_empty() {
            DEFAULT_DATE_TYPE.to_string()
        } else {
            req.date_type.trim().to_string()
        };

        let windows = split_date_windows(start, end, MAX_WINDOW_DAYS);
        let total_windows = windows.len();
        let completed = AtomicUsize::new(0);
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency.max(1)));

        let mut aggregator = ContractAggregator::new(req);
        let mut join_set: JoinSet<Result<Vec<OcdsRelease>, CollectError>> = JoinSet::new();

        for window in windows {
            if !req.wants_window(&window) {
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                req.report_progress(done, total_windows);
                continue;
            }
            let fetcher = Arc::clone(&self.fetcher);
            let semaphore = Arc::clone(&semaphore);
            let url = self.initial_url(&date_type, &window);
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| CollectError::Canceled("worker pool closed".into()))?;
                fetch_window(&fetcher, url).await
            });
        }

        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(Ok(releases)) => {
                    for release in &releases {
                        if let Some(summary) = normalize_release(release, &req.source) {
                            let matches = release_matches_filters(release, req);
                            aggregator.process_with_match(summary, matches);
                        }
                    }
                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    req.report_progress(done, total_windows);
                }
                Ok(Err(err)) => {
                    // First fatal window error cancels the remainder.
                    join_set.abort_all();
                    while join_set.join_next().await.is_some() {}
                    return Err(err);
                }
                Err(join_err) if join_err.is_cancelled() => {}
                Err(join_err) => {
                    join_set.abort_all();
                    while join_set.join_next().await.is_some() {}
                    return Err(CollectError::Canceled(format!("window worker: {join_err}")));
                }
            }
        }

        Ok(format_money(aggregator.total()))
    }
}

/// Fetch one window, following `links.next` until exhausted.
async fn fetch_window(
    fetcher: &HttpFetcher,
    initial_url: String,
) -> Result<Vec<OcdsRelease>, CollectError> {
    let mut all = Vec::new();
    let mut next_url = initial_url;
    while !next_url.is_empty() {
        debug!(url = %next_url, "ocds page fetch");
        let decoded: OcdsResponse = fetcher.get_json(&next_url).await?;
        if decoded.error_code != 0 {
            return Err(CollectError::Upstream(format!(
                "ocds api error {}: {}",
                decoded.error_code, decoded.message
            )));
        }
        all.extend(decoded.releases);
        next_url = decoded.links.next;
    }
    Ok(all)
}

/// Only contract and amendment releases participate.
fn is_contract_release(release: &OcdsRelease) -> bool {
    release
        .tag
        .iter()
        .any(|tag| tag == "contract" || tag == "contractAmendment")
}

/// Canonical contract id with any `-A<digits>` amendment suffix removed.
pub fn canonical_contract_id(release: &OcdsRelease) -> Option<String> {
    let contract = release.contracts.first()?;
    let mut id = contract.id.as_str();
    if id.is_empty() {
        id = contract.amendments.first().map(|a| a.id.as_str())?;
    }
    if id.is_empty() {
        return None;
    }
    Some(strip_amendment_suffix(id).to_string())
}

pub fn strip_amendment_suffix(id: &str) -> &str {
    if let Some(pos) = id.rfind("-A") {
        let suffix = &id[pos + 2..];
        if pos > 0 && !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            return &id[..pos];
        }
    }
    id
}

/// Contract value for a release, amendment-aware:
/// a positive `amendedvalue` wins outright; otherwise a positive
/// `contractamendmentvalue` is added to the base value; otherwise the
/// base contract value stands.
pub fn release_value(release: &OcdsRelease) -> Option<Decimal> {
    let contract = release.contracts.first()?;
    let is_amendment = release.tag.iter().any(|tag| tag == "contractAmendment");
    if is_amendment {
        if let Some(amendment) = contract.amendments.first() {
            if amendment.amended_value > Decimal::ZERO {
                return Some(amendment.amended_value);
            }
            if amendment.contract_amendment_value > Decimal::ZERO {
                let base = contract
                    .value
                    .as_ref()
                    .map(|v| v.amount)
                    .unwrap_or(Decimal::ZERO);
                return Some(base + amendment.contract_amendment_value);
            }
        }
    }
    contract.value.as_ref().map(|v| v.amount)
}

fn parse_release_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn primary_supplier(release: &OcdsRelease) -> String {
    for party in &release.parties {
        if party.roles.iter().any(|r| r.eq_ignore_ascii_case("supplier")) {
            return party.name.clone();
        }
    }
    release
        .parties
        .first()
        .map(|p| p.name.clone())
        .unwrap_or_default()
}

pub fn primary_agency(release: &OcdsRelease) -> String {
    for party in &release.parties {
        if party.roles.iter().any(|r| {
            r.eq_ignore_ascii_case("procuringEntity") || r.eq_ignore_ascii_case("buyer")
        }) {
            return party.name.clone();
        }
    }
    String::new()
}

fn contracts_text(release: &OcdsRelease) -> String {
    release
        .contracts
        .first()
        .map(|c| format!("{} {}", c.title, c.description))
        .unwrap_or_default()
}

fn tender_text(release: &OcdsRelease) -> String {
    release
        .tender
        .as_ref()
        .map(|t| format!("{} {}", t.description, t.procurement_method_details))
        .unwrap_or_default()
}

/// Release-level filter. The keyword haystack is wider than the
/// normalized summary: it includes the ocid and tender text.
pub fn release_matches_filters(release: &OcdsRelease, req: &SearchRequest) -> bool {
    let keyword = req.keyword.trim().to_lowercase();
    if !keyword.is_empty() {
        let supplier = primary_supplier(release);
        let haystacks = [
            release.id.as_str(),
            release.ocid.as_str(),
            &contracts_text(release),
            &tender_text(release),
            supplier.as_str(),
        ];
        if !haystacks
            .iter()
            .any(|text| !text.is_empty() && text.to_lowercase().contains(&keyword))
        {
            return false;
        }
    }

    let company = req.company.trim().to_lowercase();
    if !company.is_empty() && !primary_supplier(release).to_lowercase().contains(&company) {
        return false;
    }
    let agency = req.agency.trim().to_lowercase();
    if !agency.is_empty() && !primary_agency(release).to_lowercase().contains(&agency) {
        return false;
    }
    true
}

/// Normalize a release into a `MatchSummary`. Returns `None` for
/// non-contract releases, releases without a usable id, and amounts at or
/// below zero.
pub fn normalize_release(release: &OcdsRelease, source: &str) -> Option<MatchSummary> {
    if !is_contract_release(release) {
        return None;
    }
    let contract_id = canonical_contract_id(release)?;
    let amount = release_value(release)?;
    if amount <= Decimal::ZERO {
        return None;
    }
    Some(MatchSummary {
        source: austender_core::normalize_source_id(source),
        contract_id,
        release_id: release.id.clone(),
        ocid: release.ocid.clone(),
        supplier: primary_supplier(release),
        agency: primary_agency(release),
        title: release
            .contracts
            .first()
            .map(|c| c.title.clone())
            .unwrap_or_default(),
        amount,
        release_date: parse_release_time(&release.date),
        is_update: false,
    })
}
