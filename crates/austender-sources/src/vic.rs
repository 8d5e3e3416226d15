//! Victorian contract listings from tenders.vic.gov.au.
//!
//! The search page is frequently rendered client-side and intermittently
//! 403s non-browser clients; both conditions fall back to the headless
//! browser path.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use austender_core::dates::resolve_dates;
use austender_core::money::{format_money, parse_money};
use austender_core::{
    matches_summary_filters, CollectError, MatchSummary, SearchRequest,
};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use scraper::{ElementRef, Html};
use tracing::{debug, warn};

use austender_store::{ChromeFetcher, HttpClientConfig, HttpFetcher, PageFetcher};

use crate::html::{resolve_href, sel, table_headers, text_of};
use crate::registry::{Source, SourceOptions};
use crate::SCRAPE_USER_AGENT;

pub const VIC_SOURCE_ID: &str = "vic";
const VIC_SEARCH_URL: &str = "https://www.tenders.vic.gov.au/contract/search";
const MAX_PAGES: usize = 50;

pub struct VicSource {
    fetcher: Arc<HttpFetcher>,
    browser: Arc<dyn PageFetcher>,
    force_browser: bool,
}

impl VicSource {
    pub fn new(options: &SourceOptions) -> Result<Self, CollectError> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: options.request_timeout,
            user_agent: Some(SCRAPE_USER_AGENT.to_string()),
            ..Default::default()
        })?;
        let browser = ChromeFetcher::new(SCRAPE_USER_AGENT)
            .with_user_data_dir(options.cache_dir.join("vic_cookies"));
        Ok(Self {
            fetcher: Arc::new(fetcher),
            browser: Arc::new(browser),
            force_browser: options.force_vic_browser,
        })
    }

    pub fn with_fetchers(
        fetcher: Arc<HttpFetcher>,
        browser: Arc<dyn PageFetcher>,
        force_browser: bool,
    ) -> Self {
        Self {
            fetcher,
            browser,
            force_browser,
        }
    }
}

#[async_trait]
impl Source for VicSource {
    fn id(&self) -> &'static str {
        VIC_SOURCE_ID
    }

    async fn run(&self, req: &SearchRequest) -> Result<String, CollectError> {
        let (start, end) = resolve_dates(req.start_date, req.end_date, req.lookback_period);
        let mut req = req.clone();
        req.start_date = Some(start);
        req.end_date = Some(end);

        let target = build_search_url(&req);
        if self.force_browser {
            return self.run_with_browser(&req, &target).await;
        }
        match self.run_with_http(&req, &target).await {
            Err(CollectError::Blocked(reason)) => {
                warn!(reason, "vic http path blocked; retrying with headless browser");
                self.run_with_browser(&req, &target).await
            }
            other => other,
        }
    }
}

impl VicSource {
    async fn run_with_http(
        &self,
        req: &SearchRequest,
        target: &str,
    ) -> Result<String, CollectError> {
        let headers = [
            (
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
            ("Accept-Language", "en"),
            ("Referer", VIC_SEARCH_URL),
            ("Upgrade-Insecure-Requests", "1"),
        ];

        // Pre-warm the session so search results see a cookie.
        let _ = self.fetcher.get_page(VIC_SEARCH_URL, &headers).await;

        let mut total = Decimal::ZERO;
        let mut seen: HashSet<String> = HashSet::new();
        let mut observed_rows = 0usize;

        let mut url = target.to_string();
        for _ in 0..MAX_PAGES {
            debug!(%url, "vic listing fetch");
            let resp = self.fetcher.get_page(&url, &headers).await?;
            if resp.status.as_u16() == 403 {
                return Err(CollectError::Blocked("vic scrape forbidden".into()));
            }
            if !resp.status.is_success() {
                return Err(CollectError::Upstream(format!(
                    "vic listing returned {} for {}",
                    resp.status.as_u16(),
                    resp.final_url
                )));
            }

            let page = parse_listing(&resp.text(), &url);
            observed_rows += page.observed_rows;
            self.emit_rows(req, page.rows, &mut seen, &mut total).await;
            match page.next_url {
                Some(next) => url = next,
                None => break,
            }
        }

        // A 200 with an empty table means the page rendered client-side;
        // only the browser will see rows.
        if observed_rows == 0 {
            return Err(CollectError::Blocked(
                "vic results table empty without browser".into(),
            ));
        }

        Ok(format_money(total))
    }

    async fn run_with_browser(
        &self,
        req: &SearchRequest,
        target: &str,
    ) -> Result<String, CollectError> {
        let mut total = Decimal::ZERO;
        let mut seen: HashSet<String> = HashSet::new();

        let mut url = target.to_string();
        for _ in 0..MAX_PAGES {
            let html = self.browser.fetch_page(&url).await?;
            let page = parse_listing(&html, &url);
            self.emit_rows(req, page.rows, &mut seen, &mut total).await;
            match page.next_url {
                Some(next) => url = next,
                None => break,
            }
        }

        Ok(format_money(total))
    }

    async fn emit_rows(
        &self,
        req: &SearchRequest,
        rows: Vec<VicRow>,
        seen: &mut HashSet<String>,
        total: &mut Decimal,
    ) {
        for mut row in rows {
            if !seen.insert(row.summary.contract_id.clone()) {
                continue;
            }

            // Listings omit agency/supplier on some layouts; the detail
            // page carries both.
            if row.summary.agency.is_empty() || row.summary.supplier.is_empty() {
                if let Some(detail_url) = &row.detail_url {
                    match fetch_detail(&self.fetcher, detail_url).await {
                        Ok((agency, supplier)) => {
                            if row.summary.agency.is_empty() {
                                row.summary.agency = agency;
                            }
                            if row.summary.supplier.is_empty() {
                                row.summary.supplier = supplier;
                            }
                        }
                        Err(err) => {
                            debug!(detail_url, error = %err, "vic detail fetch failed");
                        }
                    }
                }
            }

            req.emit_any_match(&row.summary);
            if !matches_summary_filters(req, &row.summary, row.period_end) {
                continue;
            }
            req.emit_match(&row.summary);
            *total += row.summary.amount;
        }
    }
}

struct VicRow {
    summary: MatchSummary,
    period_end: Option<DateTime<Utc>>,
    detail_url: Option<String>,
}

struct ListingPage {
    rows: Vec<VicRow>,
    observed_rows: usize,
    next_url: Option<String>,
}

fn parse_listing(html: &str, page_url: &str) -> ListingPage {
    let document = Html::parse_document(html);
    let table_sel = sel("table");
    let row_sel = sel("tbody tr");
    let cell_sel = sel("td");
    let link_sel = sel("a");
    let next_sel = sel("a[aria-label='Next']:not(.disabled)");

    let mut rows = Vec::new();
    let mut observed_rows = 0usize;

    for table in document.select(&table_sel) {
        if !is_results_table(table) {
            continue;
        }
        for tr in table.select(&row_sel) {
            observed_rows += 1;
            let cells: Vec<ElementRef<'_>> = tr.select(&cell_sel).collect();
            if cells.len() < 6 {
                continue;
            }
            let get = |idx: usize| cells.get(idx).map(|c| text_of(*c)).unwrap_or_default();

            let contract_id = get(0);
            if !is_likely_contract_id(&contract_id) {
                continue;
            }
            let title = get(1);
            let status = get(2);
            let Some(start_date) = parse_vic_date(&get(3)) else {
                continue;
            };
            let end_date = parse_vic_date(&get(4));
            let amount = parse_money(&get(5)).unwrap_or(Decimal::ZERO);
            let agency = if cells.len() > 6 { get(6) } else { String::new() };
            let supplier = if cells.len() > 7 { get(7) } else { String::new() };

            let detail_url = tr
                .select(&link_sel)
                .next()
                .and_then(|a| a.value().attr("href"))
                .and_then(|href| resolve_href(page_url, href));

            rows.push(VicRow {
                summary: MatchSummary {
                    source: VIC_SOURCE_ID.into(),
                    contract_id: contract_id.clone(),
                    release_id: contract_id.clone(),
                    ocid: contract_id,
                    supplier,
                    agency,
                    title: build_title(&title, &status),
                    amount,
                    release_date: Some(start_date),
                    is_update: false,
                },
                period_end: end_date,
                detail_url,
            });
        }
    }

    let next_url = document
        .select(&next_sel)
        .next()
        .and_then(|el| el.value().attr("href"))
        .and_then(|href| resolve_href(page_url, href));

    ListingPage {
        rows,
        observed_rows,
        next_url,
    }
}

/// Agency (`issued by`) and supplier from a contract detail page.
async fn fetch_detail(
    fetcher: &HttpFetcher,
    detail_url: &str,
) -> Result<(String, String), CollectError> {
    let resp = fetcher
        .get_with_headers(detail_url, &[("Referer", VIC_SEARCH_URL)])
        .await?;
    Ok(parse_detail(&resp.text()))
}

fn parse_detail(html: &str) -> (String, String) {
    let document = Html::parse_document(html);
    let row_sel = sel("table tr");
    let th_sel = sel("th");
    let td_sel = sel("td");

    let mut agency = String::new();
    let mut supplier = String::new();
    for tr in document.select(&row_sel) {
        let label = tr
            .select(&th_sel)
            .next()
            .map(|th| text_of(th).to_lowercase())
            .unwrap_or_default();
        let value = tr.select(&td_sel).next().map(text_of).unwrap_or_default();
        match label.as_str() {
            "issued by" => agency = value,
            "supplier" => supplier = value,
            _ => {}
        }
    }
    (agency, supplier)
}

fn is_results_table(table: ElementRef<'_>) -> bool {
    let headers = table_headers(table).join(" | ");
    headers.contains("contract")
        && headers.contains("title")
        && (headers.contains("value") || headers.contains("cost"))
}

/// Plausibility check that keeps layout noise (section headings, blurb
/// rows) out of the results.
pub(crate) fn is_likely_contract_id(contract_id: &str) -> bool {
    let contract_id = contract_id.trim();
    if contract_id.len() < 4 || contract_id.chars().any(char::is_whitespace) {
        return false;
    }
    let mut has_digit = false;
    for ch in contract_id.chars() {
        match ch {
            '0'..='9' => has_digit = true,
            'A'..='Z' | 'a'..='z' | '-' | '_' => {}
            _ => return false,
        }
    }
    has_digit
}

pub(crate) fn build_search_url(req: &SearchRequest) -> String {
    let mut keywords = req.keyword.trim().to_string();
    let mut buyer_id = String::new();

    let agency = req.agency.trim();
    if !agency.is_empty() {
        // Numeric agencies are portal buyer ids; names fold into keywords.
        if agency.chars().all(|c| c.is_ascii_digit()) {
            buyer_id = agency.to_string();
        } else if keywords.is_empty() {
            keywords = agency.to_string();
        } else if !keywords.to_lowercase().contains(&agency.to_lowercase()) {
            keywords = format!("{keywords} {agency}");
        }
    }

    let mut qs = url::form_urlencoded::Serializer::new(String::new());
    qs.append_pair("keywords", &keywords);
    qs.append_pair("title", "");
    qs.append_pair("code", "");
    qs.append_pair("buyerId", &buyer_id);
    qs.append_pair("supplierName", req.company.trim());
    qs.append_pair("minCost", "");
    qs.append_pair("expiryDateFrom", "");
    qs.append_pair("expiryDateTo", "");
    qs.append_pair("contractStatus", "");
    qs.append_pair("awardedDateFrom", "");
    qs.append_pair("page", "");
    qs.append_pair("preset", "");
    qs.append_pair("browse", "false");
    qs.append_pair("desc", "true");
    qs.append_pair("orderBy", "startDate");
    if let Some(start) = req.start_date {
        qs.append_pair("startDateFrom", &start.format("%d/%m/%Y").to_string());
    }
    if let Some(end) = req.end_date {
        qs.append_pair("startDateTo", &end.format("%d/%m/%Y").to_string());
    }

    format!("{VIC_SEARCH_URL}?{}", qs.finish())
}

pub(crate) fn parse_vic_date(raw: &str) -> Option<DateTime<Utc>> {
    let cleaned = raw.trim();
    if cleaned.is_empty() {
        return None;
    }
    for layout in ["%d %b %Y", "%d %B %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(cleaned, layout) {
            return Some(Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)));
        }
    }
    None
}

fn build_title(title: &str, status: &str) -> String {
    let status = status.trim();
    if status.is_empty() {
        title.to_string()
    } else {
        format!("{title} ({status})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    const LISTING: &str = r#"
    <html><body>
      <table>
        <thead><tr>
          <th>Contract number</th><th>Title</th><th>Status</th>
          <th>Start date</th><th>End date</th><th>Total value</th>
          <th>Buyer</th><th>Supplier</th>
        </tr></thead>
        <tbody>
          <tr>
            <td><a href="/contract/view/1001">C-2024-1001</a></td>
            <td>Managed IT Services</td><td>Current</td>
            <td>1 Mar 2024</td><td>28 Feb 2027</td>
            <td>$3,500,000.00</td>
            <td>Department of Treasury and Finance</td>
            <td>Acme Pty Ltd</td>
          </tr>
          <tr>
            <td>not a contract row</td>
            <td></td><td></td><td></td><td></td><td></td>
          </tr>
        </tbody>
      </table>
      <a aria-label="Next" href="?page=2">Next</a>
    </body></html>"#;

    #[test]
    fn parses_results_table_rows() {
        let page = parse_listing(LISTING, "https://www.tenders.vic.gov.au/contract/search");
        assert_eq!(page.observed_rows, 2);
        assert_eq!(page.rows.len(), 1);

        let row = &page.rows[0];
        assert_eq!(row.summary.contract_id, "C-2024-1001");
        assert_eq!(row.summary.title, "Managed IT Services (Current)");
        assert_eq!(row.summary.agency, "Department of Treasury and Finance");
        assert_eq!(row.summary.supplier, "Acme Pty Ltd");
        assert_eq!(
            row.summary.amount,
            Decimal::from_str("3500000.00").unwrap()
        );
        assert_eq!(row.summary.release_date, Some(utc(2024, 3, 1)));
        assert_eq!(row.period_end, Some(utc(2027, 2, 28)));
        assert_eq!(
            row.detail_url.as_deref(),
            Some("https://www.tenders.vic.gov.au/contract/view/1001")
        );
        assert_eq!(
            page.next_url.as_deref(),
            Some("https://www.tenders.vic.gov.au/contract/search?page=2")
        );
    }

    #[test]
    fn ignores_tables_without_contract_headers() {
        let html = r#"
        <table>
          <thead><tr><th>Name</th><th>Phone</th></tr></thead>
          <tbody><tr><td>C-2024-1001</td><td>123</td></tr></tbody>
        </table>"#;
        let page = parse_listing(html, "https://www.tenders.vic.gov.au/contract/search");
        assert_eq!(page.observed_rows, 0);
        assert!(page.rows.is_empty());
    }

    #[test]
    fn contract_id_plausibility() {
        assert!(is_likely_contract_id("C-2024-1001"));
        assert!(is_likely_contract_id("ABC_123"));
        assert!(!is_likely_contract_id("abc"));
        assert!(!is_likely_contract_id("no digits"));
        assert!(!is_likely_contract_id("ONLYLETTERS"));
        assert!(!is_likely_contract_id("has space 1"));
        assert!(!is_likely_contract_id("id#1234"));
    }

    #[test]
    fn detail_page_yields_agency_and_supplier() {
        let html = r#"
        <table>
          <tr><th>Issued by</th><td>Department of Health</td></tr>
          <tr><th>Supplier</th><td>Acme Pty Ltd</td></tr>
          <tr><th>Other</th><td>ignored</td></tr>
        </table>"#;
        let (agency, supplier) = parse_detail(html);
        assert_eq!(agency, "Department of Health");
        assert_eq!(supplier, "Acme Pty Ltd");
    }

    #[test]
    fn search_url_routes_agency_by_shape() {
        let numeric = SearchRequest {
            agency: "4242".into(),
            start_date: Some(utc(2024, 1, 1)),
            end_date: Some(utc(2024, 6, 30)),
            ..Default::default()
        };
        let url = build_search_url(&numeric);
        assert!(url.contains("buyerId=4242"));
        assert!(url.contains("startDateFrom=01%2F01%2F2024"));
        assert!(url.contains("startDateTo=30%2F06%2F2024"));

        let named = SearchRequest {
            keyword: "cleaning".into(),
            agency: "Department of Health".into(),
            ..Default::default()
        };
        let url = build_search_url(&named);
        assert!(url.contains("keywords=cleaning+Department+of+Health"));
        assert!(url.contains("buyerId=&"));
    }

    #[test]
    fn vic_dates_use_spaced_layouts() {
        assert_eq!(parse_vic_date("1 Mar 2024"), Some(utc(2024, 3, 1)));
        assert_eq!(parse_vic_date("01 March 2024"), Some(utc(2024, 3, 1)));
        assert_eq!(parse_vic_date(""), None);
        assert_eq!(parse_vic_date("2024-03-01"), None);
    }
}
