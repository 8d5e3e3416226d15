//! Western Australian contracts from tenders.wa.gov.au.
//!
//! Two-step flow: a supplier-lookup JSON endpoint (by name, 11-digit ABN
//! or 9-digit ACN) feeds per-supplier listing requests; without a
//! supplier, agency/keyword searches run one listing per window.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use austender_core::dates::resolve_dates;
use austender_core::money::{format_money, parse_money};
use austender_core::{
    matches_summary_filters, split_date_windows, CollectError, DateWindow, MatchSummary,
    SearchRequest, MAX_WINDOW_DAYS,
};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use scraper::{ElementRef, Html};
use serde::Deserialize;
use tracing::debug;

use austender_store::{HttpClientConfig, HttpFetcher};

use crate::html::{resolve_href, sel, text_of};
use crate::registry::{Source, SourceOptions};
use crate::SCRAPE_USER_AGENT;

pub const WA_SOURCE_ID: &str = "wa";
const WA_SUPPLIER_SEARCH_URL: &str =
    "https://www.tenders.wa.gov.au/watenders/rest/business/searchBySupplier";
const WA_CONTRACT_SEARCH_URL: &str =
    "https://www.tenders.wa.gov.au/watenders/contract/list.action";

#[derive(Debug, Clone, Deserialize)]
pub struct WaSupplier {
    pub id: i64,
    pub name: String,
}

pub struct WaSource {
    fetcher: Arc<HttpFetcher>,
}

impl WaSource {
    pub fn new(options: &SourceOptions) -> Result<Self, CollectError> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: options.request_timeout,
            user_agent: Some(SCRAPE_USER_AGENT.to_string()),
            ..Default::default()
        })?;
        Ok(Self {
            fetcher: Arc::new(fetcher),
        })
    }

    pub fn with_fetcher(fetcher: Arc<HttpFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Source for WaSource {
    fn id(&self) -> &'static str {
        WA_SOURCE_ID
    }

    async fn run(&self, req: &SearchRequest) -> Result<String, CollectError> {
        self.run_against(req, WA_SUPPLIER_SEARCH_URL, WA_CONTRACT_SEARCH_URL)
            .await
    }
}

impl WaSource {
    /// Endpoint-parameterized run, so tests can point at a stub server.
    pub async fn run_against(
        &self,
        req: &SearchRequest,
        supplier_url: &str,
        contract_url: &str,
    ) -> Result<String, CollectError> {
        // Company drives supplier lookup; keyword substitutes only when
        // no agency narrows the search on its own.
        let mut supplier_term = req.company.trim().to_string();
        if supplier_term.is_empty() && !req.keyword.trim().is_empty() && req.agency.trim().is_empty()
        {
            supplier_term = req.keyword.trim().to_string();
        }

        let suppliers = if supplier_term.is_empty() {
            Vec::new()
        } else {
            self.find_suppliers(supplier_url, &supplier_term).await?
        };

        let (start, end) = resolve_dates(req.start_date, req.end_date, req.lookback_period);
        let windows = split_date_windows(start, end, MAX_WINDOW_DAYS);

        let mut total = Decimal::ZERO;
        let mut seen: HashSet<String> = HashSet::new();

        if !suppliers.is_empty() {
            let supplier_count = suppliers.len();
            for (idx, supplier) in suppliers.iter().enumerate() {
                req.report_progress(idx, supplier_count);

                // The endpoint fuzzy-matches; when searching by name,
                // keep only suppliers that actually contain the term.
                if !is_numeric_term(&supplier_term)
                    && !supplier
                        .name
                        .to_lowercase()
                        .contains(&supplier_term.to_lowercase())
                {
                    continue;
                }

                for window in &windows {
                    if !req.wants_window(window) {
                        continue;
                    }
                    let url =
                        build_contract_search_url(req, contract_url, Some(supplier.id), window);
                    self.collect_listing(req, &url, &supplier.name, &mut seen, &mut total)
                        .await;
                }
            }
            req.report_progress(supplier_count, supplier_count);
        } else if !req.agency.trim().is_empty() || !req.keyword.trim().is_empty() {
            let window_count = windows.len();
            for (idx, window) in windows.iter().enumerate() {
                if !req.wants_window(window) {
                    req.report_progress(idx + 1, window_count);
                    continue;
                }
                let url = build_contract_search_url(req, contract_url, None, window);
                self.collect_listing(req, &url, "Various", &mut seen, &mut total)
                    .await;
                req.report_progress(idx + 1, window_count);
            }
        }

        Ok(format_money(total))
    }

    async fn find_suppliers(
        &self,
        supplier_url: &str,
        term: &str,
    ) -> Result<Vec<WaSupplier>, CollectError> {
        let url = build_supplier_search_url(supplier_url, term);
        debug!(%url, "wa supplier lookup");
        self.fetcher
            .get_json(&url)
            .await
            .map_err(|err| match err {
                CollectError::Decode(msg) => {
                    CollectError::Decode(format!("supplier lookup: {msg}"))
                }
                other => other,
            })
    }

    async fn collect_listing(
        &self,
        req: &SearchRequest,
        url: &str,
        supplier_name: &str,
        seen: &mut HashSet<String>,
        total: &mut Decimal,
    ) {
        debug!(%url, "wa contract listing");
        let Ok(resp) = self.fetcher.get(url).await else {
            // Individual listing failures skip the window, matching the
            // best-effort sweep across suppliers.
            return;
        };

        let rows = parse_listing(&resp.text(), url);
        for row in rows {
            // Agency filtering happens before the (expensive) supplier
            // detail fetch.
            if !req.agency.trim().is_empty()
                && !row
                    .agency
                    .to_lowercase()
                    .contains(&req.agency.trim().to_lowercase())
            {
                continue;
            }
            if !seen.insert(row.reference.clone()) {
                continue;
            }

            // The listing table never shows the supplier, and the portal
            // sometimes ignores the supplier filter when combined with an
            // agency, so resolve the name from the detail page.
            let mut supplier = supplier_name.to_string();
            if let Some(detail_url) = &row.detail_url {
                if let Ok(fetched) = self.fetch_supplier(detail_url).await {
                    if !fetched.is_empty() {
                        supplier = fetched;
                    }
                }
            }

            if !req.company.trim().is_empty()
                && !supplier
                    .to_lowercase()
                    .contains(&req.company.trim().to_lowercase())
            {
                continue;
            }

            let summary = MatchSummary {
                source: WA_SOURCE_ID.into(),
                contract_id: row.reference.clone(),
                release_id: row.reference.clone(),
                ocid: row.reference,
                supplier,
                agency: row.agency,
                title: row.title,
                amount: row.amount,
                release_date: row.award_date,
                is_update: false,
            };

            req.emit_any_match(&summary);
            if !matches_summary_filters(req, &summary, None) {
                continue;
            }
            req.emit_match(&summary);
            *total += summary.amount;
        }
    }

    async fn fetch_supplier(&self, detail_url: &str) -> Result<String, CollectError> {
        let resp = self.fetcher.get(detail_url).await?;
        Ok(parse_detail_suppliers(&resp.text()).join(", "))
    }
}

struct WaRow {
    reference: String,
    title: String,
    agency: String,
    award_date: Option<DateTime<Utc>>,
    amount: Decimal,
    detail_url: Option<String>,
}

fn parse_listing(html: &str, page_url: &str) -> Vec<WaRow> {
    let document = Html::parse_document(html);
    let row_sel = sel("#contractTable tbody tr");
    let ref_sel = sel("td:nth-child(2)");
    let ref_link_sel = sel("td:nth-child(2) a");
    let title_sel = sel("td:nth-child(3)");
    let agency_sel = sel("td:nth-child(4)");
    let date_sel = sel("td:nth-child(5)");
    let value_sel = sel("td:nth-child(7)");

    let mut rows = Vec::new();
    for tr in document.select(&row_sel) {
        let reference = tr.select(&ref_sel).next().map(text_of).unwrap_or_default();
        if reference.is_empty() {
            continue;
        }
        let detail_url = tr
            .select(&ref_link_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| resolve_href(page_url, href));

        rows.push(WaRow {
            reference,
            title: tr.select(&title_sel).next().map(text_of).unwrap_or_default(),
            agency: tr
                .select(&agency_sel)
                .next()
                .map(text_of)
                .unwrap_or_default(),
            award_date: tr
                .select(&date_sel)
                .next()
                .map(text_of)
                .and_then(|raw| parse_wa_date(&raw)),
            amount: tr
                .select(&value_sel)
                .next()
                .map(text_of)
                .and_then(|raw| parse_money(&raw).ok())
                .unwrap_or(Decimal::ZERO),
            detail_url,
        });
    }
    rows
}

/// Supplier names on detail pages sit next to `1)`, `2)`, ... markers.
fn parse_detail_suppliers(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let td_sel = sel("td");
    let div_sel = sel("div");

    let mut suppliers = Vec::new();
    for td in document.select(&td_sel) {
        let text = text_of(td);
        if !is_ordinal_marker(&text) {
            continue;
        }
        let next_td = td
            .next_siblings()
            .filter_map(ElementRef::wrap)
            .find(|el| el.value().name() == "td");
        if let Some(next_td) = next_td {
            let name = next_td.select(&div_sel).next().map(text_of).unwrap_or_default();
            if !name.is_empty() {
                suppliers.push(name);
            }
        }
    }
    suppliers
}

fn is_ordinal_marker(text: &str) -> bool {
    let Some(stripped) = text.strip_suffix(')') else {
        return false;
    };
    !stripped.is_empty() && stripped.bytes().all(|b| b.is_ascii_digit())
}

fn is_numeric_term(term: &str) -> bool {
    !term.is_empty() && term.chars().all(|c| c.is_ascii_digit() || c.is_whitespace())
}

pub(crate) fn build_supplier_search_url(base: &str, term: &str) -> String {
    let digits: String = term.chars().filter(|c| c.is_ascii_digit()).collect();
    let (name, abn, acn) = if is_numeric_term(term) && digits.len() == 11 {
        ("", digits.as_str(), "")
    } else if is_numeric_term(term) && digits.len() == 9 {
        ("", "", digits.as_str())
    } else {
        (term, "", "")
    };

    let mut qs = url::form_urlencoded::Serializer::new(String::new());
    qs.append_pair("name", name);
    qs.append_pair("abn", abn);
    qs.append_pair("acn", acn);
    qs.append_pair("type", "contract");
    qs.append_pair("maxResults", "250");
    qs.append_pair("_", &Utc::now().timestamp_millis().to_string());
    format!("{base}?{}", qs.finish())
}

pub(crate) fn build_contract_search_url(
    req: &SearchRequest,
    base: &str,
    supplier_id: Option<i64>,
    window: &DateWindow,
) -> String {
    let mut qs = url::form_urlencoded::Serializer::new(String::new());
    qs.append_pair("action", "contract-search-submit");
    qs.append_pair("noreset", "yes");
    qs.append_pair("maxResults", "1000");

    if !req.agency.trim().is_empty() {
        qs.append_pair("publicAuthority", req.agency.trim());
    }
    if !req.keyword.trim().is_empty() {
        qs.append_pair("keywords", req.keyword.trim());
    } else if !req.company.trim().is_empty() {
        qs.append_pair("keywords", req.company.trim());
    }
    if let Some(id) = supplier_id {
        qs.append_pair("bySupplierId", &id.to_string());
    }
    qs.append_pair(
        "awardDateFromString",
        &window.start.format("%d/%m/%Y").to_string(),
    );
    qs.append_pair(
        "awardDateToString",
        &window.end.format("%d/%m/%Y").to_string(),
    );

    format!("{base}?{}", qs.finish())
}

pub(crate) fn parse_wa_date(raw: &str) -> Option<DateTime<Utc>> {
    let cleaned = raw.trim();
    if cleaned.is_empty() {
        return None;
    }
    for layout in ["%Y-%m-%d", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(cleaned, layout) {
            return Some(Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)));
        }
    }
    None
}
