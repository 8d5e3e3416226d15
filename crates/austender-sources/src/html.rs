//! Shared HTML extraction helpers for the portal scrapers.

use std::collections::HashMap;

use scraper::{ElementRef, Selector};
use url::Url;

/// Parse a selector known at compile time. Invalid literals are
/// programmer errors, caught by the selector tests below.
pub(crate) fn sel(raw: &str) -> Selector {
    Selector::parse(raw).unwrap_or_else(|_| panic!("invalid selector {raw:?}"))
}

/// Element text with whitespace collapsed to single spaces.
pub(crate) fn text_of(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Element text with the text of any descendant matching `exclude`
/// removed; used to strip responsive-table cell labels.
pub(crate) fn text_without(element: ElementRef<'_>, exclude: &Selector) -> String {
    let mut text = text_of(element);
    for excluded in element.select(exclude) {
        let label = text_of(excluded);
        if !label.is_empty() {
            text = text.replace(&label, " ");
        }
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract `dt`/`dd` label-value pairs from a definition list, keyed by
/// lowercased label text.
pub(crate) fn definition_pairs(dl: ElementRef<'_>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let mut last_key: Option<String> = None;
    for child in dl.children() {
        let Some(element) = ElementRef::wrap(child) else {
            continue;
        };
        match element.value().name() {
            "dt" => last_key = Some(text_of(element).to_lowercase()),
            "dd" => {
                if let Some(key) = last_key.take() {
                    out.insert(key, text_of(element));
                }
            }
            _ => {}
        }
    }
    out
}

/// Lowercased header cells of a table, from `thead` or the first row.
pub(crate) fn table_headers(table: ElementRef<'_>) -> Vec<String> {
    let thead_th = sel("thead th");
    let mut headers: Vec<String> = table
        .select(&thead_th)
        .map(|th| text_of(th).to_lowercase())
        .collect();
    if headers.is_empty() {
        let first_row_th = sel("tr th");
        headers = table
            .select(&first_row_th)
            .map(|th| text_of(th).to_lowercase())
            .collect();
    }
    headers
}

/// Resolve a possibly-relative href against the page URL.
pub(crate) fn resolve_href(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.to_lowercase().starts_with("javascript:") {
        return None;
    }
    let base = Url::parse(base).ok()?;
    base.join(href).ok().map(|u| u.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::Html;

    #[test]
    fn all_scraper_selectors_parse() {
        // Compile-time selector literals used across the adapters.
        for raw in [
            "ul.cards.profiles > li",
            "h3 a",
            "dl.details",
            ".nsw-pagination__item--next-page a.nsw-direction-link.choose-page",
            "a[aria-label='Next']:not(.disabled)",
            "table",
            "thead th",
            "tbody tr",
            "tr",
            "td",
            "th",
            "a",
            ".paging a",
            ".tablesaw-cell-label",
            "#contractTable tbody tr",
            "div",
        ] {
            assert!(Selector::parse(raw).is_ok(), "selector {raw:?} failed");
        }
    }

    #[test]
    fn definition_pairs_walk_dt_dd() {
        let html = Html::parse_fragment(
            "<dl class='details'>
                <dt>Agency</dt><dd>Department of Customer Service</dd>
                <dt>Contractor name</dt><dd> Acme  Pty Ltd </dd>
                <dt>Orphan</dt>
            </dl>",
        );
        let dl = html.select(&sel("dl.details")).next().unwrap();
        let pairs = definition_pairs(dl);
        assert_eq!(pairs["agency"], "Department of Customer Service");
        assert_eq!(pairs["contractor name"], "Acme Pty Ltd");
        assert!(!pairs.contains_key("orphan"));
    }

    #[test]
    fn text_without_strips_cell_labels() {
        let html = Html::parse_fragment(
            "<td><b class='tablesaw-cell-label'>Value</b> $1,000.00</td>",
        );
        let td = html.select(&sel("td")).next().unwrap();
        assert_eq!(text_without(td, &sel(".tablesaw-cell-label")), "$1,000.00");
    }

    #[test]
    fn hrefs_resolve_against_page_url() {
        assert_eq!(
            resolve_href("https://example.com/a/b?x=1", "/notices/123").unwrap(),
            "https://example.com/notices/123"
        );
        assert_eq!(
            resolve_href("https://example.com/a/", "next?page=2").unwrap(),
            "https://example.com/a/next?page=2"
        );
        assert!(resolve_href("https://example.com", "javascript:void(0)").is_none());
        assert!(resolve_href("https://example.com", "  ").is_none());
    }
}
