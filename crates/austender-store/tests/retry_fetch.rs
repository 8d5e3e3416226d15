//! Transport retry behavior against a loopback HTTP stub.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use austender_store::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

async fn spawn_stub(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn quick_fetcher() -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        user_agent: None,
        backoff: BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        },
    })
    .unwrap()
}

#[derive(Clone)]
struct Flaky {
    attempts: Arc<AtomicUsize>,
    failures: usize,
    status: StatusCode,
}

async fn flaky(State(state): State<Flaky>) -> impl IntoResponse {
    let n = state.attempts.fetch_add(1, Ordering::SeqCst);
    if n < state.failures {
        (state.status, "upstream sad").into_response()
    } else {
        (StatusCode::OK, "payload").into_response()
    }
}

#[tokio::test]
async fn server_errors_are_retried_until_success() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let app = Router::new().route("/flaky", get(flaky)).with_state(Flaky {
        attempts: Arc::clone(&attempts),
        failures: 2,
        status: StatusCode::INTERNAL_SERVER_ERROR,
    });
    let base = spawn_stub(app).await;

    let fetcher = quick_fetcher();
    let resp = fetcher.get(&format!("{base}/flaky")).await.unwrap();

    // 500, 500, then the decoded payload on the third attempt.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.text(), "payload");
}

#[tokio::test]
async fn too_many_requests_is_retried() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let app = Router::new().route("/flaky", get(flaky)).with_state(Flaky {
        attempts: Arc::clone(&attempts),
        failures: 1,
        status: StatusCode::TOO_MANY_REQUESTS,
    });
    let base = spawn_stub(app).await;

    let fetcher = quick_fetcher();
    let resp = fetcher.get(&format!("{base}/flaky")).await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(resp.status, StatusCode::OK);
}

#[tokio::test]
async fn retries_exhaust_into_upstream_error() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let app = Router::new().route("/flaky", get(flaky)).with_state(Flaky {
        attempts: Arc::clone(&attempts),
        failures: usize::MAX,
        status: StatusCode::INTERNAL_SERVER_ERROR,
    });
    let base = spawn_stub(app).await;

    let fetcher = quick_fetcher();
    let err = fetcher.get(&format!("{base}/flaky")).await.unwrap_err();
    // Initial attempt plus four retries.
    assert_eq!(attempts.load(Ordering::SeqCst), 5);
    assert!(err.to_string().contains("500"));
}

#[tokio::test]
async fn non_retryable_status_fails_immediately() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let app = Router::new().route("/flaky", get(flaky)).with_state(Flaky {
        attempts: Arc::clone(&attempts),
        failures: usize::MAX,
        status: StatusCode::NOT_FOUND,
    });
    let base = spawn_stub(app).await;

    let fetcher = quick_fetcher();
    let err = fetcher.get(&format!("{base}/flaky")).await.unwrap_err();
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(err.to_string().contains("404"));
}

#[tokio::test]
async fn get_page_hands_back_blocked_statuses_with_body() {
    let app = Router::new().route(
        "/challenge",
        get(|| async {
            (
                StatusCode::FORBIDDEN,
                "<script>window.gokuProps = {}</script>",
            )
        }),
    );
    let base = spawn_stub(app).await;

    let fetcher = quick_fetcher();
    let resp = fetcher
        .get_page(&format!("{base}/challenge"), &[])
        .await
        .unwrap();
    // The caller sees the 403 body and can classify the challenge.
    assert_eq!(resp.status, StatusCode::FORBIDDEN);
    assert!(resp.text().contains("gokuProps"));
}
