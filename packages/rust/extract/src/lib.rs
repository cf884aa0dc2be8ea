//! Content extraction: raw page content in, structured sections and metadata out.
//!
//! [`HtmlExtractor`] picks the main content container of an HTML page, converts
//! it to Markdown with `htmd`, splits it at headings into sections and
//! collects [`ContentMetadata`] (title, source host, word count, and the
//! currency/percentage figures mentioned in the text). Plain-text pages are
//! accepted as a single section.

mod markdown;
mod metrics;
mod sections;

use async_trait::async_trait;
use learnline_shared::{ContentMetadata, ExtractedDocument, Result};
use scraper::Html;
use tracing::{debug, instrument};
use url::Url;

/// Turns raw page content into an [`ExtractedDocument`].
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    async fn extract(&self, url: &str, raw_content: &str) -> Result<ExtractedDocument>;
}

/// Local HTML/plain-text extractor.
#[derive(Debug, Clone, Default)]
pub struct HtmlExtractor;

impl HtmlExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous extraction, used by the [`ContentExtractor`] impl.
    #[instrument(skip_all, fields(url = %url))]
    pub fn extract_document(&self, url: &str, raw_content: &str) -> Result<ExtractedDocument> {
        let source = source_host(url);

        let (title, sections, text) = if looks_like_html(raw_content) {
            let doc = Html::parse_document(raw_content);
            let title = markdown::html_title(&doc);
            let md = markdown::to_markdown(&markdown::content_html(&doc, raw_content))?;
            let lead = title.clone().unwrap_or_else(|| "Overview".to_string());
            let sections = sections::split_sections(&md, &lead);
            (title, sections, md)
        } else {
            let title = raw_content
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(|l| l.chars().take(120).collect::<String>());
            let lead = title.clone().unwrap_or_else(|| "Overview".to_string());
            let sections = sections::split_plain(raw_content, &lead);
            (title, sections, raw_content.to_string())
        };

        let metadata = ContentMetadata {
            title,
            source,
            metrics: metrics::extract_metrics(&text),
            word_count: markdown::count_words(&text),
        };

        debug!(
            sections = sections.len(),
            metrics = metadata.metrics.len(),
            word_count = metadata.word_count,
            "extraction complete"
        );

        Ok(ExtractedDocument { sections, metadata })
    }
}

#[async_trait]
impl ContentExtractor for HtmlExtractor {
    async fn extract(&self, url: &str, raw_content: &str) -> Result<ExtractedDocument> {
        self.extract_document(url, raw_content)
    }
}

fn looks_like_html(raw: &str) -> bool {
    let head: String = raw.trim_start().chars().take(512).collect::<String>().to_lowercase();
    head.starts_with('<')
        || head.contains("<html")
        || head.contains("<body")
        || head.contains("<p>")
        || head.contains("<div")
}

fn source_host(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
}
