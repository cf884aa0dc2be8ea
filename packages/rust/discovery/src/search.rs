//! Content discovery: search query text in, raw candidate pages out.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use learnline_shared::{DiscoveryConfig, LearnlineError, Result};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::answering::AnsweringService;
use crate::fetch::{PageFetcher, RawPage};
use crate::host_is_blocked;

/// Returns candidate pages for a search query.
#[async_trait]
pub trait SearchService: Send + Sync {
    async fn search(&self, query_text: &str) -> Result<Vec<RawPage>>;
}

/// [`SearchService`] that asks the answering service and fetches its citations.
///
/// Fails only when the answering call itself fails. Pages that cannot be
/// fetched are skipped.
pub struct CitationSearch {
    answering: Arc<dyn AnsweringService>,
    fetcher: PageFetcher,
    blocked_hosts: Vec<String>,
    max_results: usize,
}

impl CitationSearch {
    pub fn new(
        answering: Arc<dyn AnsweringService>,
        fetcher: PageFetcher,
        config: &DiscoveryConfig,
    ) -> Self {
        Self {
            answering,
            fetcher,
            blocked_hosts: config.blocked_hosts.clone(),
            max_results: config.max_results_per_query,
        }
    }

    /// Parse, dedupe and screen cited URLs, keeping at most `max_results`.
    fn candidate_urls(&self, citations: &[String]) -> Vec<Url> {
        let mut seen = HashSet::new();
        let mut urls = Vec::new();
        for raw in citations {
            let Ok(mut url) = Url::parse(raw) else {
                debug!(url = %raw, "skipping unparseable citation");
                continue;
            };
            url.set_fragment(None);
            let Some(host) = url.host_str() else {
                continue;
            };
            if host_is_blocked(host, &self.blocked_hosts) {
                debug!(%url, "skipping blocked host");
                continue;
            }
            if self.fetcher.refuses(&url) {
                warn!(%url, "SSRF protection: blocked");
                continue;
            }
            if seen.insert(url.to_string()) {
                urls.push(url);
            }
            if urls.len() >= self.max_results {
                break;
            }
        }
        urls
    }
}

#[async_trait]
impl SearchService for CitationSearch {
    #[instrument(skip_all, fields(query = %query_text))]
    async fn search(&self, query_text: &str) -> Result<Vec<RawPage>> {
        let answer = self
            .answering
            .ask(query_text, &[])
            .await
            .map_err(|e| match e {
                LearnlineError::Upstream { message, .. } => {
                    LearnlineError::upstream("search", message)
                }
                other => other,
            })?;

        let urls = self.candidate_urls(&answer.citations);
        let mut pages = Vec::with_capacity(urls.len());
        for url in &urls {
            match self.fetcher.fetch(url).await {
                Ok(page) if !page.raw_content.trim().is_empty() => pages.push(page),
                Ok(_) => debug!(%url, "empty page skipped"),
                Err(e) => warn!(%url, error = %e, "page fetch failed, skipping"),
            }
        }

        info!(
            citations = answer.citations.len(),
            fetched = pages.len(),
            "search complete"
        );
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use learnline_shared::Query;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::answering::Answer;
    use crate::retry::RetryPolicy;

    struct CannedAnswers {
        citations: Vec<String>,
    }

    #[async_trait]
    impl AnsweringService for CannedAnswers {
        async fn ask(&self, _query: &str, _context: &[Query]) -> Result<Answer> {
            Ok(Answer {
                response_text: "see sources".into(),
                citations: self.citations.clone(),
            })
        }
    }

    struct DownAnswers;

    #[async_trait]
    impl AnsweringService for DownAnswers {
        async fn ask(&self, _query: &str, _context: &[Query]) -> Result<Answer> {
            Err(LearnlineError::upstream("answering", "HTTP 503"))
        }
    }

    fn search_with(answering: Arc<dyn AnsweringService>) -> CitationSearch {
        let config = DiscoveryConfig::default();
        let fetcher = PageFetcher::new(&config)
            .unwrap()
            .allow_localhost()
            .with_retry_policy(RetryPolicy::new(1, Duration::ZERO));
        CitationSearch::new(answering, fetcher, &config)
    }

    #[tokio::test]
    async fn fetches_cited_pages_and_skips_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/good"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<p>GPU demand</p>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let search = search_with(Arc::new(CannedAnswers {
            citations: vec![
                format!("{}/good", server.uri()),
                format!("{}/good#section", server.uri()),
                format!("{}/gone", server.uri()),
                "https://www.youtube.com/watch?v=abc".into(),
                "not a url".into(),
            ],
        }));

        let pages = search.search("AI chip demand drivers").await.unwrap();
        assert_eq!(pages.len(), 1);
        assert!(pages[0].url.ends_with("/good"));
    }

    #[tokio::test]
    async fn answering_failure_fails_the_search() {
        let search = search_with(Arc::new(DownAnswers));
        let err = search.search("anything").await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().starts_with("search error"));
    }

    #[test]
    fn caps_candidates() {
        let search = search_with(Arc::new(CannedAnswers { citations: vec![] }));
        let citations: Vec<String> = (0..20)
            .map(|i| format!("https://example.com/{i}"))
            .collect();
        assert_eq!(
            search.candidate_urls(&citations).len(),
            DiscoveryConfig::default().max_results_per_query
        );
    }
}
