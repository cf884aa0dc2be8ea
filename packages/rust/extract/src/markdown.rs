//! HTML to Markdown conversion with a small cleanup pipeline.

use std::sync::LazyLock;

use learnline_shared::{LearnlineError, Result};
use regex::Regex;
use scraper::{Html, Selector};

/// Content containers in priority order; `<body>` is the fallback.
const CONTENT_SELECTORS: &[&str] = &[
    "article",
    "main",
    "[role=\"main\"]",
    ".article-body",
    ".post-content",
    ".entry-content",
    ".content",
];

/// Tags never worth converting, wherever they appear.
const SKIP_TAGS: &[&str] = &[
    "script", "style", "nav", "header", "footer", "aside", "form", "button", "iframe",
    "noscript", "svg", "figure",
];

/// Title of the page: `<title>`, else the first `<h1>`.
pub(crate) fn html_title(doc: &Html) -> Option<String> {
    for sel in ["title", "h1"] {
        let Ok(selector) = Selector::parse(sel) else {
            continue;
        };
        if let Some(el) = doc.select(&selector).next() {
            let text = el.text().collect::<String>();
            let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

/// Inner HTML of the main content container.
pub(crate) fn content_html(doc: &Html, raw: &str) -> String {
    for sel in CONTENT_SELECTORS.iter().chain(std::iter::once(&"body")) {
        if let Ok(selector) = Selector::parse(sel) {
            if let Some(el) = doc.select(&selector).next() {
                return el.inner_html();
            }
        }
    }
    raw.to_string()
}

/// Convert a fragment of content HTML to cleaned Markdown.
pub(crate) fn to_markdown(content_html: &str) -> Result<String> {
    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(SKIP_TAGS.to_vec())
        .build();

    let raw = converter
        .convert(content_html)
        .map_err(|e| LearnlineError::Conversion(format!("htmd conversion failed: {e}")))?;

    Ok(cleanup(&raw))
}

/// Strip link targets and images, drop leftover tags, collapse blank runs.
fn cleanup(md: &str) -> String {
    static IMAGE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").expect("valid regex"));
    static LINK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").expect("valid regex"));
    static TAG_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"</?[a-zA-Z][^>]*>").expect("valid regex"));
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    let md = IMAGE_RE.replace_all(md, "");
    let md = LINK_RE.replace_all(&md, "$1");
    let md = TAG_RE.replace_all(&md, "");
    let md = md
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    MULTI_BLANK_RE
        .replace_all(&md, "\n\n")
        .trim()
        .to_string()
}

/// Count words, ignoring heading markers.
pub(crate) fn count_words(text: &str) -> usize {
    text.split_whitespace()
        .filter(|w| !w.chars().all(|c| c == '#' || c == '-' || c == '*'))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_article_over_body_chrome() {
        let html = r#"<html><head><title>Chip demand</title></head><body>
            <nav><a href="/">Home</a></nav>
            <article><h1>Chip demand</h1><p>Hyperscalers buy accelerators.</p></article>
            <footer>Copyright 2025</footer>
        </body></html>"#;
        let doc = Html::parse_document(html);
        let md = to_markdown(&content_html(&doc, html)).unwrap();

        assert!(md.contains("# Chip demand"));
        assert!(md.contains("Hyperscalers buy accelerators."));
        assert!(!md.contains("Copyright"));
        assert_eq!(html_title(&doc).as_deref(), Some("Chip demand"));
    }

    #[test]
    fn cleanup_keeps_link_text_only() {
        let md = cleanup("See [the filing](https://sec.gov/x) ![chart](c.png)\n\n\n\nNext");
        assert_eq!(md, "See the filing\n\nNext");
    }

    #[test]
    fn word_count_skips_markers() {
        assert_eq!(count_words("## Overview\n- GPUs dominate"), 3);
    }
}
