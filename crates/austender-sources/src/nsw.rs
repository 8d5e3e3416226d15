//! NSW contract-award notices from buy.nsw.gov.au.
//!
//! The portal sits behind AWS WAF; the plain HTTP path detects the JS
//! challenge and falls back to the headless browser. Windows run in
//! parallel with a shared dedup set and running total.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use austender_core::dates::resolve_dates;
use austender_core::money::{format_money, parse_money};
use austender_core::window::default_concurrency;
use austender_core::{
    matches_summary_filters, split_date_windows, CollectError, DateWindow, MatchSummary,
    SearchRequest, MAX_WINDOW_DAYS,
};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use scraper::Html;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use austender_store::{ChromeFetcher, HttpClientConfig, HttpFetcher, PageFetcher};

use crate::html::{definition_pairs, resolve_href, sel, text_of};
use crate::registry::{Source, SourceOptions};
use crate::SCRAPE_USER_AGENT;

pub const NSW_SOURCE_ID: &str = "nsw";
const NSW_SEARCH_URL: &str = "https://buy.nsw.gov.au/notices/search";
const MAX_PAGES_PER_WINDOW: usize = 200;
const AMOUNT_LABEL: &str = "estimated amount payable to the contractor (including gst)";

pub struct NswSource {
    fetcher: Arc<HttpFetcher>,
    browser: Arc<dyn PageFetcher>,
    force_browser: bool,
}

impl NswSource {
    pub fn new(options: &SourceOptions) -> Result<Self, CollectError> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: options.request_timeout,
            user_agent: Some(SCRAPE_USER_AGENT.to_string()),
            ..Default::default()
        })?;
        let browser = ChromeFetcher::new(SCRAPE_USER_AGENT)
            .with_user_data_dir(options.cache_dir.join("nsw_cookies"));
        Ok(Self {
            fetcher: Arc::new(fetcher),
            browser: Arc::new(browser),
            force_browser: options.force_nsw_browser,
        })
    }

    /// Substitute fetchers; used by tests.
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
impl Source for NswSource {
    fn id(&self) -> &'static str {
        NSW_SOURCE_ID
    }

    async fn run(&self, req: &SearchRequest) -> Result<String, CollectError> {
        let (start, end) = resolve_dates(req.start_date, req.end_date, req.lookback_period);
        // Monthly windows so long lookbacks parallelize.
        let windows = split_date_windows(start, end, MAX_WINDOW_DAYS);

        if self.force_browser {
            return self.run_with_browser(req, &windows).await;
        }
        match self.run_with_http(req, &windows).await {
            Err(CollectError::Blocked(reason)) => {
                warn!(reason, "nsw http path blocked; retrying with headless browser");
                self.run_with_browser(req, &windows).await
            }
            other => other,
        }
    }
}

/// Run-wide shared scrape state: one collector per window feeds these.
struct SharedAgg {
    seen: Mutex<HashSet<String>>,
    total: Mutex<Decimal>,
}

impl SharedAgg {
    fn new() -> Self {
        Self {
            seen: Mutex::new(HashSet::new()),
            total: Mutex::new(Decimal::ZERO),
        }
    }

    fn first_seen(&self, contract_id: &str) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(contract_id.to_string())
    }

    fn add(&self, amount: Decimal) {
        *self.total.lock().unwrap_or_else(|e| e.into_inner()) += amount;
    }

    fn total(&self) -> Decimal {
        *self.total.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl NswSource {
    async fn run_with_http(
        &self,
        req: &SearchRequest,
        windows: &[DateWindow],
    ) -> Result<String, CollectError> {
        if windows.is_empty() {
            return Ok(format_money(Decimal::ZERO));
        }
        let shared = Arc::new(SharedAgg::new());
        let total_windows = windows.len();
        let completed = Arc::new(AtomicUsize::new(0));
        let concurrency = default_concurrency().min(total_windows).max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));

        let mut join_set: JoinSet<Result<(), CollectError>> = JoinSet::new();
        for window in windows {
            if !req.wants_window(window) {
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                req.report_progress(done, total_windows);
                continue;
            }
            let fetcher = Arc::clone(&self.fetcher);
            let shared = Arc::clone(&shared);
            let semaphore = Arc::clone(&semaphore);
            let req = req.clone();
            let window = *window;
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| CollectError::Canceled("worker pool closed".into()))?;
                fetch_window_http(&fetcher, &req, &window, &shared).await
            });
        }

        let mut first_err: Option<CollectError> = None;
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(Ok(())) => {
                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    req.report_progress(done, total_windows);
                }
                Ok(Err(err)) => {
                    if first_err.is_none() {
                        join_set.abort_all();
                        first_err = Some(err);
                    }
                }
                Err(join_err) if join_err.is_cancelled() => {}
                Err(join_err) => {
                    if first_err.is_none() {
                        join_set.abort_all();
                        first_err = Some(CollectError::Canceled(format!(
                            "window worker: {join_err}"
                        )));
                    }
                }
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }

        Ok(format_money(shared.total()))
    }

    async fn run_with_browser(
        &self,
        req: &SearchRequest,
        windows: &[DateWindow],
    ) -> Result<String, CollectError> {
        let shared = SharedAgg::new();
        let total_windows = windows.len();
        let mut completed = 0usize;

        for window in windows {
            if !req.wants_window(window) {
                completed += 1;
                req.report_progress(completed, total_windows);
                continue;
            }

            let mut url = build_search_url(req, 1, window);
            for _ in 0..MAX_PAGES_PER_WINDOW {
                let mut html = self.browser.fetch_page(&url).await?;
                if is_waf_challenge(&html) {
                    // Give the in-browser challenge time to complete,
                    // then re-read once.
                    html = self.browser.fetch_page(&url).await?;
                }

                let page = parse_listing(&html, &url);
                emit_rows(req, &shared, page.rows);
                match page.next_url {
                    Some(next) => url = next,
                    None => break,
                }
            }

            completed += 1;
            req.report_progress(completed, total_windows);
        }

        Ok(format_money(shared.total()))
    }
}

async fn fetch_window_http(
    fetcher: &HttpFetcher,
    req: &SearchRequest,
    window: &DateWindow,
    shared: &SharedAgg,
) -> Result<(), CollectError> {
    let headers = [
        (
            "Accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        ),
        ("Accept-Language", "en"),
        ("Upgrade-Insecure-Requests", "1"),
        ("Referer", NSW_SEARCH_URL),
    ];

    let mut url = build_search_url(req, 1, window);
    for _ in 0..MAX_PAGES_PER_WINDOW {
        debug!(%url, "nsw listing fetch");
        let resp = fetcher.get_page(&url, &headers).await?;
        let body = resp.text();
        if is_waf_challenge(&body) {
            return Err(CollectError::Blocked("nsw scrape blocked by WAF".into()));
        }
        if !resp.status.is_success() {
            return Err(CollectError::Upstream(format!(
                "nsw listing returned {} for {}",
                resp.status.as_u16(),
                resp.final_url
            )));
        }

        let page = parse_listing(&body, &url);
        emit_rows(req, shared, page.rows);
        match page.next_url {
            Some(next) => url = next,
            None => break,
        }
    }
    Ok(())
}

struct NswRow {
    summary: MatchSummary,
    period_end: Option<DateTime<Utc>>,
}

struct ListingPage {
    rows: Vec<NswRow>,
    next_url: Option<String>,
}

/// AWS WAF JS challenge markers observed in blocked responses.
pub(crate) fn is_waf_challenge(body: &str) -> bool {
    if body.is_empty() {
        return false;
    }
    let lowered = body.to_lowercase();
    lowered.contains("awswafcookiedomainlist") || lowered.contains("gokuprops")
}

fn parse_listing(html: &str, page_url: &str) -> ListingPage {
    let document = Html::parse_document(html);
    let card_sel = sel("ul.cards.profiles > li");
    let link_sel = sel("h3 a");
    let details_sel = sel("dl.details");
    let next_sel = sel(".nsw-pagination__item--next-page a.nsw-direction-link.choose-page");

    let mut rows = Vec::new();
    for card in document.select(&card_sel) {
        let (title, notice_url) = match card.select(&link_sel).next() {
            Some(link) => (
                text_of(link),
                link.value()
                    .attr("href")
                    .and_then(|href| resolve_href(page_url, href))
                    .unwrap_or_default(),
            ),
            None => (String::new(), String::new()),
        };
        let notice_id = extract_notice_id(&notice_url);

        let fields: HashMap<String, String> = card
            .select(&details_sel)
            .next()
            .map(definition_pairs)
            .unwrap_or_default();

        let agency = fields.get("agency").cloned().unwrap_or_default();
        let supplier = fields.get("contractor name").cloned().unwrap_or_default();
        let can_id = fields.get("can id").cloned().unwrap_or_default();
        let publish_date = fields
            .get("publish date")
            .and_then(|raw| parse_nsw_date(raw));
        let (_, period_end) = fields
            .get("contract period")
            .map(|raw| parse_contract_period(raw))
            .unwrap_or((None, None));
        let amount = fields
            .get(AMOUNT_LABEL)
            .and_then(|raw| parse_money(raw).ok())
            .unwrap_or(Decimal::ZERO);

        // Prefer the CAN id, then the notice slug, then the title.
        let contract_id = [can_id.as_str(), notice_id.as_str(), title.as_str()]
            .into_iter()
            .find(|c| !c.trim().is_empty())
            .unwrap_or_default()
            .trim()
            .to_string();
        if contract_id.is_empty() {
            continue;
        }

        rows.push(NswRow {
            summary: MatchSummary {
                source: NSW_SOURCE_ID.into(),
                contract_id: contract_id.clone(),
                release_id: notice_id,
                ocid: contract_id,
                supplier,
                agency,
                title,
                amount,
                release_date: publish_date,
                is_update: false,
            },
            period_end,
        });
    }

    let next_url = document
        .select(&next_sel)
        .next()
        .and_then(|el| el.value().attr("href"))
        .and_then(|href| resolve_href(page_url, href));

    ListingPage { rows, next_url }
}

fn emit_rows(req: &SearchRequest, shared: &SharedAgg, rows: Vec<NswRow>) {
    for row in rows {
        if !shared.first_seen(&row.summary.contract_id) {
            continue;
        }
        req.emit_any_match(&row.summary);
        if !matches_summary_filters(req, &row.summary, row.period_end) {
            continue;
        }
        req.emit_match(&row.summary);
        shared.add(row.summary.amount);
    }
}

pub(crate) fn build_search_url(req: &SearchRequest, page: usize, window: &DateWindow) -> String {
    let mut qs = url::form_urlencoded::Serializer::new(String::new());
    qs.append_pair("mode", "advanced");

    let mut query = req.keyword.trim();
    if query.is_empty() {
        query = req.company.trim();
    }
    if !query.is_empty() {
        qs.append_pair("query", query);
    }

    // The portal only filters agencies by internal uuid; names go unused.
    let agency = req.agency.trim();
    if is_uuid(agency) {
        qs.append_pair("agencies", agency);
    }

    qs.append_pair("dateFrom", &window.start.format("%Y-%m-%d").to_string());
    qs.append_pair("dateTo", &window.end.format("%Y-%m-%d").to_string());

    // Contract award notices only.
    qs.append_pair("noticeTypes", "can");
    qs.append_pair("categories", "");
    qs.append_pair("sort", "");
    if page > 0 {
        qs.append_pair("page", &page.to_string());
    }

    format!("{NSW_SEARCH_URL}?{}", qs.finish())
}

fn is_uuid(value: &str) -> bool {
    let groups: Vec<&str> = value.split('-').collect();
    groups.len() == 5
        && [8usize, 4, 4, 4, 12]
            .iter()
            .zip(&groups)
            .all(|(len, group)| {
                group.len() == *len && group.bytes().all(|b| b.is_ascii_hexdigit())
            })
}

fn extract_notice_id(notice_url: &str) -> String {
    let Ok(url) = url::Url::parse(notice_url.trim()) else {
        return String::new();
    };
    let Some(last) = url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
    else {
        return String::new();
    };
    if last.eq_ignore_ascii_case("notices") {
        return String::new();
    }
    last.to_string()
}

pub(crate) fn parse_nsw_date(raw: &str) -> Option<DateTime<Utc>> {
    let cleaned = raw.trim();
    if cleaned.is_empty() {
        return None;
    }
    for layout in ["%d-%b-%Y", "%d-%b-%y"] {
        if let Ok(date) = NaiveDate::parse_from_str(cleaned, layout) {
            return Some(Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)));
        }
    }
    None
}

fn parse_contract_period(raw: &str) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let cleaned = raw.trim();
    let Some((from, to)) = cleaned.split_once(" to ") else {
        return (None, None);
    };
    (parse_nsw_date(from), parse_nsw_date(to))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    const LISTING: &str = r#"
    <html><body>
      <ul class="cards profiles">
        <li>
          <h3><a href="/notices/can-12345">ICT Services Panel</a></h3>
          <dl class="details">
            <dt>Agency</dt><dd>Department of Customer Service</dd>
            <dt>Contractor name</dt><dd>Acme Pty Ltd</dd>
            <dt>CAN ID</dt><dd>CAN-2024-001</dd>
            <dt>Publish date</dt><dd>6-Feb-2024</dd>
            <dt>Contract period</dt><dd>22-Jan-2024 to 31-Oct-2026</dd>
            <dt>Estimated amount payable to the contractor (including GST)</dt>
            <dd>$542,560.00</dd>
          </dl>
        </li>
        <li>
          <h3><a href="/notices/can-67890">Road Works</a></h3>
          <dl class="details">
            <dt>Agency</dt><dd>Transport for NSW</dd>
            <dt>Contractor name</dt><dd>Bitumen Bros</dd>
            <dt>CAN ID</dt><dd>CAN-2024-002</dd>
            <dt>Publish date</dt><dd>7-Feb-2024</dd>
            <dt>Estimated amount payable to the contractor (including GST)</dt>
            <dd>$10,000.00</dd>
          </dl>
        </li>
      </ul>
      <div class="nsw-pagination__item--next-page">
        <a class="nsw-direction-link choose-page" href="?page=2">Next</a>
      </div>
    </body></html>"#;

    #[test]
    fn parses_cards_and_next_link() {
        let page = parse_listing(LISTING, "https://buy.nsw.gov.au/notices/search?page=1");
        assert_eq!(page.rows.len(), 2);

        let first = &page.rows[0].summary;
        assert_eq!(first.contract_id, "CAN-2024-001");
        assert_eq!(first.release_id, "can-12345");
        assert_eq!(first.supplier, "Acme Pty Ltd");
        assert_eq!(first.agency, "Department of Customer Service");
        assert_eq!(first.amount, Decimal::from_str("542560.00").unwrap());
        assert_eq!(first.release_date, Some(utc(2024, 2, 6)));
        assert_eq!(page.rows[0].period_end, Some(utc(2026, 10, 31)));

        assert_eq!(
            page.next_url.as_deref(),
            Some("https://buy.nsw.gov.au/notices/search?page=2")
        );
    }

    #[test]
    fn emit_rows_dedupes_and_filters() {
        let page = parse_listing(LISTING, "https://buy.nsw.gov.au/notices/search");
        let shared = SharedAgg::new();
        let req = SearchRequest {
            company: "acme".into(),
            ..Default::default()
        };
        emit_rows(&req, &shared, page.rows);
        assert_eq!(shared.total(), Decimal::from_str("542560.00").unwrap());

        // Re-emitting the same cards adds nothing.
        let again = parse_listing(LISTING, "https://buy.nsw.gov.au/notices/search");
        emit_rows(&req, &shared, again.rows);
        assert_eq!(shared.total(), Decimal::from_str("542560.00").unwrap());
    }

    #[test]
    fn detects_waf_challenge_markers() {
        assert!(is_waf_challenge("<script>window.awsWafCookieDomainList=[]</script>"));
        assert!(is_waf_challenge("var gokuProps = {};"));
        assert!(!is_waf_challenge("<html><body>results</body></html>"));
        assert!(!is_waf_challenge(""));
    }

    #[test]
    fn search_url_carries_advanced_filters() {
        let req = SearchRequest {
            keyword: "cyber security".into(),
            agency: "123e4567-e89b-12d3-a456-426614174000".into(),
            ..Default::default()
        };
        let window = DateWindow {
            start: utc(2024, 1, 1),
            end: utc(2024, 2, 1),
        };
        let url = build_search_url(&req, 1, &window);
        assert!(url.starts_with(NSW_SEARCH_URL));
        assert!(url.contains("mode=advanced"));
        assert!(url.contains("query=cyber+security"));
        assert!(url.contains("agencies=123e4567-e89b-12d3-a456-426614174000"));
        assert!(url.contains("dateFrom=2024-01-01"));
        assert!(url.contains("dateTo=2024-02-01"));
        assert!(url.contains("noticeTypes=can"));
        assert!(url.contains("page=1"));
    }

    #[test]
    fn agency_names_are_not_sent_as_uuids() {
        let req = SearchRequest {
            agency: "Transport for NSW".into(),
            company: "Acme".into(),
            ..Default::default()
        };
        let window = DateWindow {
            start: utc(2024, 1, 1),
            end: utc(2024, 2, 1),
        };
        let url = build_search_url(&req, 1, &window);
        assert!(!url.contains("agencies="));
        // Keyword empty: company becomes the query.
        assert!(url.contains("query=Acme"));
    }

    #[test]
    fn notice_id_is_last_path_segment() {
        assert_eq!(
            extract_notice_id("https://buy.nsw.gov.au/notices/can-123?x=1"),
            "can-123"
        );
        assert_eq!(extract_notice_id("https://buy.nsw.gov.au/notices/"), "");
        assert_eq!(extract_notice_id("not a url"), "");
    }

    #[test]
    fn nsw_dates_use_dashed_layouts() {
        assert_eq!(parse_nsw_date("6-Feb-2018"), Some(utc(2018, 2, 6)));
        assert_eq!(parse_nsw_date("06-Feb-2018"), Some(utc(2018, 2, 6)));
        assert_eq!(parse_nsw_date("6-Feb-18"), Some(utc(2018, 2, 6)));
        assert_eq!(parse_nsw_date("bogus"), None);
    }
}
