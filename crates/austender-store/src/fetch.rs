//! Retrying HTTP transport shared by every source.

use std::time::Duration;

use austender_core::CollectError;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Transient upstream pressure: throttling and server-side failures.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff: 1s base, doubled per attempt, four retries.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// HTTP client with retry/backoff. Backoff sleeps are plain awaits, so
/// aborting the owning task cancels them.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, CollectError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .cookie_store(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder
            .build()
            .map_err(|err| CollectError::Upstream(format!("building http client: {err}")))?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET expecting success; any non-2xx status left after retries is an
    /// upstream failure.
    pub async fn get(&self, url: &str) -> Result<FetchedResponse, CollectError> {
        let resp = self.get_with_headers(url, &[]).await?;
        Self::require_success(resp)
    }

    pub async fn get_with_headers(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, CollectError> {
        let resp = self.execute(url, headers).await?;
        Self::require_success(resp)
    }

    /// GET for scrape paths that inspect anti-bot challenge bodies: 429
    /// and 5xx are retried, but other non-2xx responses come back as-is
    /// with their body so the caller can classify them.
    pub async fn get_page(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, CollectError> {
        self.execute(url, headers).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, CollectError> {
        let resp = self.get(url).await?;
        serde_json::from_slice(&resp.body)
            .map_err(|err| CollectError::Decode(format!("{url}: {err}")))
    }

    fn require_success(resp: FetchedResponse) -> Result<FetchedResponse, CollectError> {
        if resp.status.is_success() {
            Ok(resp)
        } else {
            Err(CollectError::Upstream(format!(
                "http status {} for {}",
                resp.status.as_u16(),
                resp.final_url
            )))
        }
    }

    async fn execute(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, CollectError> {
        let mut last_err: Option<String> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.get(url);
            for (name, value) in headers {
                request = request.header(*name, *value);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success()
                        || classify_status(status) == RetryDisposition::NonRetryable
                    {
                        let body = resp
                            .bytes()
                            .await
                            .map_err(|err| CollectError::Upstream(format!("{url}: {err}")))?
                            .to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }
                    last_err = Some(format!("http status {} for {final_url}", status.as_u16()));
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                        return Err(CollectError::Upstream(format!("{url}: {err}")));
                    }
                    last_err = Some(err.to_string());
                }
            }

            if attempt < self.backoff.max_retries {
                let delay = self.backoff.delay_for_attempt(attempt);
                debug!(url, attempt, delay_ms = delay.as_millis() as u64, "retrying request");
                tokio::time::sleep(delay).await;
            }
        }

        Err(CollectError::Upstream(
            last_err.unwrap_or_else(|| format!("request to {url} failed after retries")),
        ))
    }
}
