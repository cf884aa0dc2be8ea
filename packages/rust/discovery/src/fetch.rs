//! Raw page fetching for discovered URLs.

use std::time::Duration;

use learnline_shared::{DiscoveryConfig, LearnlineError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use crate::retry::{RetryPolicy, with_retry};
use crate::{USER_AGENT, is_ssrf_target, map_status};

/// Maximum response body we accept (5 MB).
const MAX_RESPONSE_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum number of redirects to follow.
const MAX_REDIRECTS: usize = 5;

/// An unprocessed page returned by the search service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPage {
    /// Final URL after redirects.
    pub url: String,
    pub raw_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// HTTP page fetcher with size limits, SSRF protection and retry.
#[derive(Clone)]
pub struct PageFetcher {
    client: Client,
    retry: RetryPolicy,
    /// Allow localhost/private IPs (for integration tests with mock servers).
    allow_localhost: bool,
}

impl PageFetcher {
    pub fn new(config: &DiscoveryConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .build()
            .map_err(|e| LearnlineError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            retry: RetryPolicy::new(
                config.max_retries.max(1),
                Duration::from_millis(config.retry_base_delay_ms),
            ),
            allow_localhost: false,
        })
    }

    /// Allow fetching localhost/private IPs (for integration tests).
    pub fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Whether this fetcher refuses `url` outright.
    pub fn refuses(&self, url: &Url) -> bool {
        !self.allow_localhost && is_ssrf_target(url)
    }

    /// Fetch a single page.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn fetch(&self, url: &Url) -> Result<RawPage> {
        if self.refuses(url) {
            return Err(LearnlineError::validation(format!(
                "{url}: refusing to fetch private or non-HTTP target"
            )));
        }
        with_retry(self.retry, "fetch", || self.fetch_once(url)).await
    }

    async fn fetch_once(&self, url: &Url) -> Result<RawPage> {
        debug!("fetching page");

        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| LearnlineError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(map_status("fetch", status, ""));
        }

        if let Some(len) = response.content_length() {
            if len > MAX_RESPONSE_SIZE {
                return Err(LearnlineError::validation(format!(
                    "{url}: response too large ({len} bytes, max {MAX_RESPONSE_SIZE})"
                )));
            }
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let raw_content = response
            .text()
            .await
            .map_err(|e| LearnlineError::Network(format!("{url}: failed to read body: {e}")))?;

        Ok(RawPage {
            url: final_url,
            raw_content,
            content_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn fetcher() -> PageFetcher {
        PageFetcher::new(&DiscoveryConfig::default())
            .unwrap()
            .allow_localhost()
            .with_retry_policy(RetryPolicy::new(2, Duration::ZERO))
    }

    #[tokio::test]
    async fn fetches_page_with_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/article"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html; charset=utf-8")
                    .set_body_string("<html><body><h1>AI chips</h1></body></html>"),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/article", server.uri())).unwrap();
        let page = fetcher().fetch(&url).await.unwrap();

        assert!(page.raw_content.contains("AI chips"));
        assert!(page.content_type.unwrap().starts_with("text/html"));
    }

    #[tokio::test]
    async fn not_found_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/missing", server.uri())).unwrap();
        assert!(fetcher().fetch(&url).await.is_err());
    }

    #[tokio::test]
    async fn refuses_localhost_by_default() {
        let fetcher = PageFetcher::new(&DiscoveryConfig::default()).unwrap();
        let url = Url::parse("http://127.0.0.1:9/").unwrap();
        let err = fetcher.fetch(&url).await.unwrap_err();
        assert!(err.to_string().contains("refusing"));
    }
}
