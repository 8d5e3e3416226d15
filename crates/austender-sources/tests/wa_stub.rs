//! WA source end-to-end against loopback supplier-lookup and listing
//! stubs.

use std::sync::Arc;
use std::time::Duration;

use austender_core::SearchRequest;
use austender_sources::wa::WaSource;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{TimeZone, Utc};
use serde_json::json;

async fn suppliers() -> impl IntoResponse {
    Json(json!([
        {"id": 1, "name": "Acme Pty Ltd"},
        {"id": 2, "name": "Unrelated Holdings"}
    ]))
}

async fn listing() -> impl IntoResponse {
    Html(
        r#"
        <table id="contractTable">
          <thead><tr>
            <th></th><th>Reference</th><th>Title</th><th>Agency</th>
            <th>Award Date</th><th>Expiry</th><th>Value</th>
          </tr></thead>
          <tbody>
            <tr>
              <td>1</td>
              <td><a href="/detail/99">WAT-2024-99</a></td>
              <td>Laundry Services</td>
              <td>Department of Health WA</td>
              <td>15/03/2024</td>
              <td>14/03/2026</td>
              <td>$96,500.00</td>
            </tr>
          </tbody>
        </table>"#,
    )
}

async fn detail() -> impl IntoResponse {
    Html(
        r#"
        <table>
          <tr><td>1)</td><td><div>Acme Pty Ltd</div></td></tr>
        </table>"#,
    )
}

async fn spawn_stub() -> String {
    let app = Router::new()
        .route("/suppliers", get(suppliers))
        .route("/list", get(listing))
        .route("/detail/:id", get(detail));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn fetcher() -> Arc<austender_store::HttpFetcher> {
    Arc::new(
        austender_store::HttpFetcher::new(austender_store::HttpClientConfig {
            timeout: Duration::from_secs(5),
            ..Default::default()
        })
        .unwrap(),
    )
}

#[tokio::test]
async fn supplier_flow_collects_matching_contracts() {
    let base = spawn_stub().await;
    let source = WaSource::with_fetcher(fetcher());

    let total = source
        .run_against(
            &SearchRequest {
                company: "Acme".into(),
                start_date: Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
                end_date: Some(Utc.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).unwrap()),
                ..Default::default()
            },
            &format!("{base}/suppliers"),
            &format!("{base}/list"),
        )
        .await
        .unwrap();

    // Only the Acme supplier matches the name filter, and the detail
    // page confirms the supplier on the single listed contract.
    assert_eq!(total, "$96,500.00");
}

#[tokio::test]
async fn agency_filter_drops_unmatched_rows() {
    let base = spawn_stub().await;
    let source = WaSource::with_fetcher(fetcher());

    let total = source
        .run_against(
            &SearchRequest {
                company: "Acme".into(),
                agency: "Department of Education".into(),
                start_date: Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
                end_date: Some(Utc.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).unwrap()),
                ..Default::default()
            },
            &format!("{base}/suppliers"),
            &format!("{base}/list"),
        )
        .await
        .unwrap();
    assert_eq!(total, "$0.00");
}

#[tokio::test]
async fn keyword_only_search_runs_without_supplier_lookup() {
    let base = spawn_stub().await;
    let source = WaSource::with_fetcher(fetcher());

    let total = source
        .run_against(
            &SearchRequest {
                keyword: "laundry".into(),
                agency: "Health".into(),
                start_date: Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
                end_date: Some(Utc.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).unwrap()),
                ..Default::default()
            },
            &format!("{base}/suppliers"),
            &format!("{base}/list"),
        )
        .await
        .unwrap();
    assert_eq!(total, "$96,500.00");
}
