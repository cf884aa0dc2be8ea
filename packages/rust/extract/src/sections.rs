//! Splitting Markdown into titled sections.

use std::sync::LazyLock;

use learnline_shared::ContentSection;
use regex::Regex;

/// Longest section body kept, in characters.
const MAX_SECTION_CHARS: usize = 4000;

/// Most sections kept per document.
const MAX_SECTIONS: usize = 40;

/// Split Markdown at H1-H3 headings.
///
/// Text before the first heading becomes a section titled `lead_title`.
/// Sections with an empty body are dropped.
pub(crate) fn split_sections(md: &str, lead_title: &str) -> Vec<ContentSection> {
    static HEADING_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^#{1,3}\s+(.+?)\s*#*$").expect("valid regex"));

    let mut sections = Vec::new();
    let mut title = lead_title.to_string();
    let mut body = String::new();

    for line in md.lines() {
        if let Some(caps) = HEADING_RE.captures(line) {
            push_section(&mut sections, &title, &body);
            title = caps[1].to_string();
            body.clear();
        } else {
            body.push_str(line);
            body.push('\n');
        }
    }
    push_section(&mut sections, &title, &body);

    sections.truncate(MAX_SECTIONS);
    sections
}

/// Split plain text into paragraph-sized sections.
pub(crate) fn split_plain(text: &str, lead_title: &str) -> Vec<ContentSection> {
    let body = text
        .split("\n\n")
        .map(|p| p.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut sections = Vec::new();
    push_section(&mut sections, lead_title, &body);
    sections
}

fn push_section(sections: &mut Vec<ContentSection>, title: &str, body: &str) {
    let body = body.trim();
    if body.is_empty() {
        return;
    }
    sections.push(ContentSection {
        title: title.trim().to_string(),
        body: truncate_chars(body, MAX_SECTION_CHARS),
    });
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_headings_with_lead() {
        let md = "Intro paragraph.\n\n## Supply\nFoundry capacity is tight.\n\n### Packaging\nCoWoS limits output.\n\n## Empty\n";
        let sections = split_sections(md, "AI chips");

        let titles: Vec<&str> = sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["AI chips", "Supply", "Packaging"]);
        assert_eq!(sections[1].body, "Foundry capacity is tight.");
    }

    #[test]
    fn long_bodies_are_truncated() {
        let md = format!("# Big\n{}", "é".repeat(MAX_SECTION_CHARS + 10));
        let sections = split_sections(&md, "lead");
        assert_eq!(sections[0].body.chars().count(), MAX_SECTION_CHARS + 1);
    }

    #[test]
    fn plain_text_collapses_whitespace() {
        let sections = split_plain("GPU   demand\nis rising.\n\n\n\nMargins  expand.", "Notes");
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].body, "GPU demand is rising.\n\nMargins expand.");
    }
}
