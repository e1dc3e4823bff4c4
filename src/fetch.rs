//! Retrieval of candidate pages.
//!
//! Three fetchers share the [`Fetcher`] trait:
//! - [`HttpFetcher`]: one plain GET with a fixed timeout.
//! - [`BrowserFetcher`]: headless Chromium, waits for client-side rendering and
//!   reads the rendered body text.
//! - [`HybridFetcher`]: HTTP first, browser only for promising candidates.
//!
//! There is no retry. A failure is the terminal status of that candidate for the run.

use crate::classify::KeywordClassifier;
use crate::config::{BrowserSettings, HttpSettings, HybridSettings};
use crate::types::{FetchMethod, RawResponse, ScanStatus};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use futures::{Future, StreamExt};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("static pattern compiles"));

const BODY_TEXT_JS: &str = "document.body ? document.body.innerText : ''";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("timeout: {0}")]
    Timeout(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("browser error: {0}")]
    Browser(String),
}

impl FetchError {
    /// Terminal scan status recorded for a candidate whose fetch failed this way.
    pub fn status(&self) -> ScanStatus {
        match self {
            FetchError::Timeout(_) => ScanStatus::Timeout,
            FetchError::Connection(_) => ScanStatus::ConnectionError,
            FetchError::Browser(_) => ScanStatus::BrowserError,
        }
    }
}

/// Source of rendered page content for a URL.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<RawResponse, FetchError>;

    /// Release long-lived resources (browser processes). Called once at the end of a scan.
    async fn shutdown(&self) {}
}

/// Plain HTTP GET.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(settings: &HttpSettings) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent(settings.user_agent.clone())
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| FetchError::Connection(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<RawResponse, FetchError> {
        let start = Instant::now();
        let resp = self.client.get(url).send().await.map_err(map_reqwest)?;
        let status_code = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let body = resp.text().await.map_err(map_reqwest)?;
        let title = extract_title(&body);
        debug!(url, status_code, bytes = body.len(), "http fetch complete");
        Ok(RawResponse {
            status_code,
            final_url,
            title,
            content_length: body.len(),
            body_text: body,
            elapsed: start.elapsed(),
            method: FetchMethod::Http,
        })
    }
}

fn map_reqwest(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout(e.to_string())
    } else {
        FetchError::Connection(e.to_string())
    }
}

/// Text of the first `<title>` element, whitespace-collapsed, with common entities decoded.
pub fn extract_title(html: &str) -> String {
    let Some(raw) = TITLE_RE.captures(html).and_then(|c| c.get(1)) else {
        return String::new();
    };
    let collapsed = raw.as_str().split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
}

struct BrowserSession {
    browser: Browser,
    handler: JoinHandle<()>,
}

impl BrowserSession {
    async fn launch(settings: &BrowserSettings) -> Result<Self, FetchError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .window_size(1920, 1080)
            .request_timeout(Duration::from_secs(settings.page_timeout_secs))
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions");
        if !settings.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &settings.chrome_path {
            builder = builder.chrome_executable(path);
        }
        let config = builder.build().map_err(FetchError::Browser)?;

        let (browser, mut handler) = Browser::launch(config).await.map_err(map_cdp)?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });
        debug!("browser launched");
        Ok(Self { browser, handler })
    }

    async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            debug!("browser close failed: {e}");
        }
        let _ = self.browser.wait().await;
        self.handler.abort();
    }
}

/// Headless Chromium fetcher.
///
/// The browser is launched on first use and reused; each candidate gets its own
/// page. With `relaunch_each`, every candidate gets a fresh browser process.
pub struct BrowserFetcher {
    settings: BrowserSettings,
    shared: Mutex<Option<Arc<BrowserSession>>>,
}

impl BrowserFetcher {
    pub fn new(settings: BrowserSettings) -> Self {
        Self {
            settings,
            shared: Mutex::new(None),
        }
    }

    async fn session(&self) -> Result<Arc<BrowserSession>, FetchError> {
        let mut guard = self.shared.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        let session = Arc::new(BrowserSession::launch(&self.settings).await?);
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Opens a blank tab, then navigates and reads it under `budget`. The tab is
    /// closed whether the load succeeds, fails or times out.
    async fn render(
        &self,
        browser: &Browser,
        url: &str,
        start: Instant,
        budget: Duration,
    ) -> Result<RawResponse, FetchError> {
        let page = tokio::time::timeout(budget, browser.new_page("about:blank"))
            .await
            .map_err(|_| budget_exceeded(budget))?
            .map_err(map_cdp)?;
        close_after(
            page,
            budget,
            |page| async move { self.load(&page, url, start).await },
            |page| async move {
                if let Err(e) = page.close().await {
                    debug!(url, "page close failed: {e}");
                }
            },
        )
        .await
    }

    async fn load(&self, page: &Page, url: &str, start: Instant) -> Result<RawResponse, FetchError> {
        page.goto(url).await.map_err(map_cdp)?;
        self.read_page(page, url, start).await
    }

    async fn read_page(&self, page: &Page, url: &str, start: Instant) -> Result<RawResponse, FetchError> {
        tokio::time::sleep(Duration::from_millis(self.settings.render_wait_ms)).await;
        let title = page.get_title().await.map_err(map_cdp)?.unwrap_or_default();
        let final_url = page
            .url()
            .await
            .map_err(map_cdp)?
            .unwrap_or_else(|| url.to_string());
        let body_text: String = page
            .evaluate(BODY_TEXT_JS)
            .await
            .map_err(map_cdp)?
            .into_value()
            .map_err(|e| FetchError::Browser(format!("unreadable body text: {e}")))?;
        let body_text = body_text.trim().to_string();
        debug!(url, chars = body_text.len(), "browser render complete");
        Ok(RawResponse {
            // The rendered DOM does not expose the document's HTTP status.
            status_code: 0,
            final_url,
            title,
            content_length: body_text.len(),
            body_text,
            elapsed: start.elapsed(),
            method: FetchMethod::Browser,
        })
    }
}

#[async_trait]
impl Fetcher for BrowserFetcher {
    async fn fetch(&self, url: &str) -> Result<RawResponse, FetchError> {
        let start = Instant::now();
        let budget = Duration::from_secs(self.settings.page_timeout_secs)
            + Duration::from_millis(self.settings.render_wait_ms);

        if self.settings.relaunch_each {
            let session = BrowserSession::launch(&self.settings).await?;
            let result = self.render(&session.browser, url, start, budget).await;
            session.close().await;
            return result;
        }

        let session = self.session().await?;
        self.render(&session.browser, url, start, budget).await
    }

    async fn shutdown(&self) {
        let Some(session) = self.shared.lock().await.take() else {
            return;
        };
        match Arc::try_unwrap(session) {
            Ok(session) => session.close().await,
            Err(_) => warn!("browser still in use at shutdown; leaving it to be killed on drop"),
        }
    }
}

fn budget_exceeded(budget: Duration) -> FetchError {
    FetchError::Timeout(format!("page load exceeded {budget:?}"))
}

/// Runs `work` on a handle to `page` with a deadline, then hands the page to
/// `close` on every path.
async fn close_after<P, T, W, WF, C, CF>(page: P, budget: Duration, work: W, close: C) -> Result<T, FetchError>
where
    P: Clone,
    W: FnOnce(P) -> WF,
    WF: Future<Output = Result<T, FetchError>>,
    C: FnOnce(P) -> CF,
    CF: Future<Output = ()>,
{
    let result = match tokio::time::timeout(budget, work(page.clone())).await {
        Ok(result) => result,
        Err(_) => Err(budget_exceeded(budget)),
    };
    close(page).await;
    result
}

fn map_cdp(e: CdpError) -> FetchError {
    if matches!(e, CdpError::Timeout) {
        return FetchError::Timeout(e.to_string());
    }
    let msg = e.to_string();
    if msg.contains("net::ERR_") {
        FetchError::Connection(msg)
    } else {
        FetchError::Browser(msg)
    }
}

/// HTTP pre-filter; candidates that look promising are re-fetched with a browser.
pub struct HybridFetcher {
    http: Arc<dyn Fetcher>,
    browser: Arc<dyn Fetcher>,
    prefilter: KeywordClassifier,
    settings: HybridSettings,
}

impl HybridFetcher {
    pub fn new(
        http: Arc<dyn Fetcher>,
        browser: Arc<dyn Fetcher>,
        prefilter: KeywordClassifier,
        settings: HybridSettings,
    ) -> Self {
        Self {
            http,
            browser,
            prefilter,
            settings,
        }
    }

    /// No error keywords, and either enough business keywords or an unusually large page.
    pub fn is_promising(&self, response: &RawResponse) -> bool {
        let text = format!(
            "{}\n{}",
            response.body_text.to_lowercase(),
            response.title.to_lowercase()
        );
        let (business_hits, error_hits) = self.prefilter.score(&text);
        error_hits == 0
            && (business_hits >= self.settings.min_business_hits
                || response.content_length > self.settings.min_content_length)
    }
}

#[async_trait]
impl Fetcher for HybridFetcher {
    async fn fetch(&self, url: &str) -> Result<RawResponse, FetchError> {
        let first = self.http.fetch(url).await?;
        if !self.is_promising(&first) {
            return Ok(first);
        }
        debug!(url, "promising http response; verifying with browser");
        let mut verified = self.browser.fetch(url).await?;
        verified.elapsed += first.elapsed;
        Ok(verified)
    }

    async fn shutdown(&self) {
        self.http.shutdown().await;
        self.browser.shutdown().await;
    }
}
