//! South Australian contract awards from tenders.sa.gov.au.
//!
//! The portal sits behind Cloudflare, so this source always drives the
//! headless browser. Table layouts vary, so the results table is chosen
//! by scoring header matches and columns are addressed by label.

use std::collections::{HashMap, HashSet};
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
use tracing::debug;

use austender_store::{ChromeFetcher, PageFetcher};

use crate::html::{sel, table_headers, text_without};
use crate::registry::{Source, SourceOptions};
use crate::SCRAPE_USER_AGENT;

pub const SA_SOURCE_ID: &str = "sa";
const SA_SEARCH_URL: &str = "https://www.tenders.sa.gov.au/contract/search";
const MAX_PAGES: usize = 250;

const KNOWN_HEADERS: &[&str] = &[
    "contract",
    "code",
    "reference",
    "buyer",
    "agency",
    "supplier",
    "contractor",
    "start",
    "start date",
    "awarded",
    "awarded date",
    "value",
    "amount",
    "cost",
    "total cost",
    "description",
    "title",
];

pub struct SaSource {
    browser: Arc<dyn PageFetcher>,
    debug_html: bool,
}

impl SaSource {
    pub fn new(options: &SourceOptions) -> Result<Self, CollectError> {
        let browser = ChromeFetcher::new(SCRAPE_USER_AGENT)
            .with_user_data_dir(options.cache_dir.join("sa_cookies"));
        Ok(Self {
            browser: Arc::new(browser),
            debug_html: options.sa_debug_html,
        })
    }

    pub fn with_page_fetcher(browser: Arc<dyn PageFetcher>) -> Self {
        Self {
            browser,
            debug_html: false,
        }
    }
}

#[async_trait]
impl Source for SaSource {
    fn id(&self) -> &'static str {
        SA_SOURCE_ID
    }

    async fn run(&self, req: &SearchRequest) -> Result<String, CollectError> {
        let (start, end) = resolve_dates(req.start_date, req.end_date, req.lookback_period);

        // One big window keeps the browser page count down; the cache
        // supplies a gate when it wants month-grained skips.
        let windows = if req.should_fetch_window.is_some() {
            split_date_windows(start, end, MAX_WINDOW_DAYS)
        } else {
            vec![DateWindow { start, end }]
        };

        let mut total = Decimal::ZERO;
        let mut seen: HashSet<String> = HashSet::new();
        let total_windows = windows.len();
        let mut completed = 0usize;

        for window in &windows {
            if !req.wants_window(window) {
                completed += 1;
                req.report_progress(completed, total_windows);
                continue;
            }

            for page_num in 1..=MAX_PAGES {
                let target = build_search_url(req, page_num, window);
                debug!(%target, "sa listing fetch");
                let mut html = self.browser.fetch_page(&target).await?;
                if is_cloudflare_blocked(&html) {
                    // The challenge sometimes clears on a second load.
                    html = self.browser.fetch_page(&target).await?;
                    if is_cloudflare_blocked(&html) {
                        return Err(CollectError::Blocked("sa scrape blocked".into()));
                    }
                }

                if self.debug_html {
                    let _ = std::fs::write(
                        format!("/tmp/sa_page_{page_num}.html"),
                        html.as_bytes(),
                    );
                }

                let page = parse_listing(&html, req, page_num);
                for summary in page.rows {
                    if !seen.insert(summary.contract_id.clone()) {
                        continue;
                    }
                    req.emit_any_match(&summary);
                    if !matches_summary_filters(req, &summary, None) {
                        continue;
                    }
                    req.emit_match(&summary);
                    total += summary.amount;
                }

                if !page.has_next {
                    break;
                }
            }

            completed += 1;
            req.report_progress(completed, total_windows);
        }

        Ok(format_money(total))
    }
}

struct ListingPage {
    rows: Vec<MatchSummary>,
    has_next: bool,
}

fn parse_listing(html: &str, req: &SearchRequest, page_num: usize) -> ListingPage {
    let document = Html::parse_document(html);
    let rows = match find_results_table(&document) {
        Some((table, columns)) => extract_rows(table, &columns, req),
        None => Vec::new(),
    };
    let has_next = has_next_page(&document, page_num);
    ListingPage { rows, has_next }
}

fn extract_rows(
    table: ElementRef<'_>,
    columns: &HashMap<String, usize>,
    req: &SearchRequest,
) -> Vec<MatchSummary> {
    let tbody_tr = sel("tbody tr");
    let tr = sel("tr");
    let td = sel("td");
    let label_sel = sel(".tablesaw-cell-label");

    let mut rows: Vec<ElementRef<'_>> = table.select(&tbody_tr).collect();
    if rows.is_empty() {
        rows = table.select(&tr).collect();
    }

    let mut out = Vec::new();
    for row in rows {
        let cells: Vec<ElementRef<'_>> = row.select(&td).collect();
        if cells.is_empty() {
            continue;
        }
        let get = |idx: Option<usize>| -> String {
            idx.and_then(|i| cells.get(i))
                .map(|cell| text_without(*cell, &label_sel))
                .unwrap_or_default()
        };

        let mut contract_id = get(first_index(columns, &["reference", "code", "contract", "id"]));
        let title = get(first_index(columns, &["description", "title"]));
        let mut buyer = get(first_index(columns, &["buyer", "agency"]));
        let mut supplier = get(first_index(columns, &["supplier", "contractor"]));
        let start_date = parse_sa_date(&get(first_index(columns, &["start date", "start"])));
        let award_date = parse_sa_date(&get(first_index(columns, &["awarded date", "awarded"])));
        let amount = parse_money(&get(first_index(
            columns,
            &["value", "amount", "cost", "total cost"],
        )))
        .unwrap_or(Decimal::ZERO);

        if contract_id.is_empty() {
            contract_id = title.clone();
        }
        if contract_id.is_empty() {
            continue;
        }

        // Sparse layouts omit supplier/agency; backfill from the request
        // so searched-for rows survive the filters with some context.
        if supplier.is_empty() && !req.keyword.trim().is_empty() {
            supplier = req.keyword.trim().to_string();
        }
        if supplier.is_empty() && !req.company.trim().is_empty() {
            supplier = req.company.trim().to_string();
        }
        if buyer.is_empty() && !req.agency.trim().is_empty() {
            buyer = req.agency.trim().to_string();
        }

        out.push(MatchSummary {
            source: SA_SOURCE_ID.into(),
            contract_id: contract_id.clone(),
            release_id: contract_id.clone(),
            ocid: contract_id,
            supplier,
            agency: buyer,
            title,
            amount,
            release_date: award_date.or(start_date),
            is_update: false,
        });
    }
    out
}

/// Pick the table whose headers best match the known contract columns.
fn find_results_table(document: &Html) -> Option<(ElementRef<'_>, HashMap<String, usize>)> {
    let table_sel = sel("table");
    let tbody_tr = sel("tbody tr");
    let tr = sel("tr");

    let mut best: Option<(i32, ElementRef<'_>, HashMap<String, usize>)> = None;
    for table in document.select(&table_sel) {
        let headers = table_headers(table);
        if headers.is_empty() {
            continue;
        }

        let mut columns = HashMap::new();
        let mut score = 0;
        for (idx, header) in headers.iter().enumerate() {
            for known in KNOWN_HEADERS {
                if header.contains(known) {
                    columns.insert((*known).to_string(), idx);
                    score += 1;
                }
            }
        }

        let mut row_count = table.select(&tbody_tr).count();
        if row_count == 0 {
            row_count = table.select(&tr).count();
        }
        if row_count < 2 {
            continue;
        }

        if best.as_ref().map(|(s, _, _)| score > *s).unwrap_or(true) {
            best = Some((score, table, columns));
        }
    }
    best.map(|(_, table, columns)| (table, columns))
}

fn first_index(columns: &HashMap<String, usize>, keys: &[&str]) -> Option<usize> {
    keys.iter().find_map(|key| columns.get(*key).copied())
}

fn has_next_page(document: &Html, page_num: usize) -> bool {
    let paging_sel = sel(".paging a");
    let needle = format!("page.value={}", page_num + 1);
    document.select(&paging_sel).any(|a| {
        a.value()
            .attr("title")
            .map(|t| t.to_lowercase().contains("go to page"))
            .unwrap_or(false)
            && a.value()
                .attr("href")
                .map(|href| href.contains(&needle))
                .unwrap_or(false)
    })
}

pub(crate) fn is_cloudflare_blocked(html: &str) -> bool {
    let lowered = html.to_lowercase();
    (lowered.contains("attention required") && lowered.contains("cloudflare"))
        || lowered.contains("cf-browser-verification")
        || lowered.contains("__cf_chl")
}

pub(crate) fn build_search_url(req: &SearchRequest, page_num: usize, window: &DateWindow) -> String {
    let mut keywords = req.keyword.trim().to_string();
    let company = req.company.trim();
    if !company.is_empty() {
        if keywords.is_empty() {
            keywords = company.to_string();
        } else if !keywords.to_lowercase().contains(&company.to_lowercase()) {
            keywords = format!("{keywords} {company}");
        }
    }

    let mut buyer_id = String::new();
    let agency = req.agency.trim();
    if !agency.is_empty() {
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
    qs.append_pair("code", "");
    qs.append_pair("buyerId", &buyer_id);
    qs.append_pair("minCost", "");
    qs.append_pair(
        "startDateFrom",
        &window.start.format("%d/%m/%Y").to_string(),
    );
    qs.append_pair("startDateTo", &window.end.format("%d/%m/%Y").to_string());
    qs.append_pair("awardedDateFrom", "");
    qs.append_pair("page", &page_num.max(1).to_string());
    qs.append_pair("preset", "");
    qs.append_pair("browse", "false");
    qs.append_pair("desc", "true");
    qs.append_pair("orderBy", "startDate");

    format!("{SA_SEARCH_URL}?{}", qs.finish())
}

pub(crate) fn parse_sa_date(raw: &str) -> Option<DateTime<Utc>> {
    let cleaned = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        return None;
    }
    // The portal renders "Sept", which no standard abbreviation layout
    // accepts.
    let normalized = cleaned.replace("Sept", "Sep");

    for layout in [
        "%d/%m/%Y",
        "%Y-%m-%d",
        "%d %b %Y",
        "%d %B %Y",
        "%d-%b-%Y",
    ] {
        if let Ok(date) = NaiveDate::parse_from_str(&normalized, layout) {
            return Some(Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)));
        }
    }
    None
}
