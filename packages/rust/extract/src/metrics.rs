//! Quantitative facts (currency amounts and percentages) found in page text.

use std::collections::HashSet;
use std::sync::LazyLock;

use learnline_shared::{Metric, MetricKind};
use regex::Regex;

/// Most metrics kept per document.
const MAX_METRICS: usize = 20;

static CURRENCY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\$\s?\d[\d,]*(?:\.\d+)?(?:\s?(?:trillion|billion|million|thousand|bn|tn|mn|[kmbt])\b)?",
    )
    .expect("valid regex")
});

static PERCENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\d+(?:\.\d+)?\s?(?:%|percent\b)").expect("valid regex")
});

static SENTENCE_END_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]\s+|\n+").expect("valid regex"));

/// Extract metrics, each with the sentence it appeared in.
pub(crate) fn extract_metrics(text: &str) -> Vec<Metric> {
    let mut seen = HashSet::new();
    let mut metrics = Vec::new();

    for sentence in SENTENCE_END_RE.split(text) {
        let sentence = sentence.trim().trim_start_matches(['#', '-', '*', ' ']);
        if sentence.is_empty() {
            continue;
        }
        for (kind, re) in [
            (MetricKind::Currency, &*CURRENCY_RE),
            (MetricKind::Percentage, &*PERCENT_RE),
        ] {
            for m in re.find_iter(sentence) {
                let value = m.as_str().trim().to_string();
                if seen.insert((kind, value.clone(), sentence.to_string())) {
                    metrics.push(Metric {
                        kind,
                        value,
                        context: sentence.to_string(),
                    });
                }
                if metrics.len() >= MAX_METRICS {
                    return metrics;
                }
            }
        }
    }
    metrics
}
