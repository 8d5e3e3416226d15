//! Headless-browser page fetching, kept behind a trait so anti-bot
//! fallbacks stay out of the parse paths.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use austender_core::CollectError;
use headless_chrome::{Browser, LaunchOptions};
use tracing::debug;

/// Fetch a listing page and return its rendered HTML. Implemented by the
/// headless-Chrome driver; tests substitute canned pages.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<String, CollectError>;
}

/// Headless Chrome driver. Each fetch navigates a fresh tab, waits for
/// the document plus a settle period (client-side tables and JS
/// challenges render after load), and returns the full outer HTML.
pub struct ChromeFetcher {
    user_agent: String,
    user_data_dir: Option<PathBuf>,
    settle: Duration,
}

impl ChromeFetcher {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            user_data_dir: None,
            settle: Duration::from_millis(1200),
        }
    }

    /// Persist the browser profile (cookies, WAF clearances) under the
    /// given directory, e.g. `<cacheDir>/nsw_cookies`.
    pub fn with_user_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.user_data_dir = Some(dir.into());
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    fn fetch_blocking(
        url: String,
        user_agent: String,
        user_data_dir: Option<PathBuf>,
        settle: Duration,
    ) -> Result<String, CollectError> {
        let mut builder = LaunchOptions::default_builder();
        builder.headless(true).args(vec![
            OsStr::new("--disable-gpu"),
            OsStr::new("--disable-dev-shm-usage"),
            OsStr::new("--disable-blink-features=AutomationControlled"),
        ]);
        if let Some(dir) = user_data_dir {
            std::fs::create_dir_all(&dir)?;
            builder.user_data_dir(Some(dir));
        }
        let options = builder
            .build()
            .map_err(|err| CollectError::Upstream(format!("browser launch options: {err}")))?;

        let browser = Browser::new(options)
            .map_err(|err| CollectError::Upstream(format!("launching headless browser: {err}")))?;
        let tab = browser
            .new_tab()
            .map_err(|err| CollectError::Upstream(format!("opening browser tab: {err}")))?;
        tab.set_user_agent(&user_agent, None, None)
            .map_err(|err| CollectError::Upstream(format!("setting user agent: {err}")))?;

        debug!(%url, "browser navigate");
        tab.navigate_to(&url)
            .map_err(|err| CollectError::Upstream(format!("browser navigate {url}: {err}")))?;
        tab.wait_until_navigated()
            .map_err(|err| CollectError::Upstream(format!("browser load {url}: {err}")))?;
        std::thread::sleep(settle);

        tab.get_content()
            .map_err(|err| CollectError::Upstream(format!("reading page content: {err}")))
    }
}

#[async_trait]
impl PageFetcher for ChromeFetcher {
    async fn fetch_page(&self, url: &str) -> Result<String, CollectError> {
        let url = url.to_string();
        let user_agent = self.user_agent.clone();
        let user_data_dir = self.user_data_dir.clone();
        let settle = self.settle;
        tokio::task::spawn_blocking(move || {
            Self::fetch_blocking(url, user_agent, user_data_dir, settle)
        })
        .await
        .map_err(|err| CollectError::Canceled(format!("browser task: {err}")))?
    }
}
