//! Relevance filtering of discovered candidates.
//!
//! Acceptance mirrors the strategy asymmetry: background for a new topic is
//! accepted loosely, content for a struggle only when it can resolve the
//! confusion. With default thresholds anything kept for a struggle is also
//! kept for a new topic without context. Every rejection carries a
//! [`RejectionReason`] for the next strategy attempt.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use learnline_shared::{
    Depth, ExtractedDocument, FilterConfig, KnowledgeState, LearningMoment, MomentKind, QueryLine,
    Recommendation, Rejection, RejectionReason,
};
use tracing::{debug, instrument};

use crate::text::{Lexicon, concept_tokens, informative_tokens, tokenize};

const TECHNICAL_MARKERS: &[&str] = &[
    "algorithm", "algorithms", "architecture", "asymptotic", "bandwidth", "benchmark",
    "benchmarks", "cagr", "coefficient", "compiler", "derivative", "discounted", "ebitda",
    "elasticity", "heterogeneous", "instruction", "kernel", "kernels", "latency",
    "microarchitecture", "occupancy", "optimization", "proof", "regression", "simd", "simt",
    "theorem", "throughput", "warp", "warps",
];
const INTRO_MARKERS: &[&str] = &[
    "analogy", "basic", "basics", "beginner", "beginners", "easy", "everyday", "explained",
    "guide", "imagine", "introduction", "overview", "simple", "simply",
];
const PATH_FORWARD_MARKERS: &[&str] = &[
    "next steps",
    "learn more",
    "further reading",
    "getting started",
    "roadmap",
    "where to start",
    "how to",
];
const EXPLANATORY_MARKERS: &[&str] = &[
    "for example",
    "for instance",
    "imagine",
    "think of",
    "analogy",
    "step by step",
    "step 1",
    "in other words",
    "simply put",
    "like a",
];

/// Technical markers per 100 words at which a page reads as expert material.
const EXPERT_RATE: f64 = 4.0;
const TECHNICAL_RATE: f64 = 1.5;
/// Tokens considered when judging how much of a page is already known.
const NOVELTY_SAMPLE: usize = 30;
const MAX_RELEVANT_SECTIONS: usize = 3;

/// A discovered page with its extracted content, ranked by discovery order.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub content_id: String,
    pub url: String,
    pub document: ExtractedDocument,
    /// Rank of the strategy query that found it.
    pub query_rank: usize,
    /// Rank within that query's results.
    pub discovery_rank: usize,
}

/// The filter's verdict on one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub keep: bool,
    pub explanation: String,
    pub relevant_sections: Vec<String>,
    pub value_score: f64,
    /// Set exactly when `keep` is false.
    pub reason: Option<RejectionReason>,
}

impl Evaluation {
    fn kept(explanation: String, relevant_sections: Vec<String>, value_score: f64) -> Self {
        Self {
            keep: true,
            explanation,
            relevant_sections,
            value_score: value_score.clamp(0.0, 1.0),
            reason: None,
        }
    }

    fn rejected(reason: RejectionReason, detail: String) -> Self {
        Self {
            keep: false,
            explanation: detail,
            relevant_sections: Vec::new(),
            value_score: 0.0,
            reason: Some(reason),
        }
    }

    pub fn recommendation(&self, candidate: &Candidate) -> Option<Recommendation> {
        self.keep.then(|| Recommendation {
            content_id: candidate.content_id.clone(),
            url: candidate.url.clone(),
            title: candidate.document.metadata.title.clone(),
            explanation: self.explanation.clone(),
            relevant_sections: self.relevant_sections.clone(),
            value_score: self.value_score,
        })
    }

    pub fn rejection(&self, candidate: &Candidate) -> Option<Rejection> {
        self.reason.map(|reason| Rejection {
            content_id: candidate.content_id.clone(),
            url: candidate.url.clone(),
            reason,
            detail: self.explanation.clone(),
        })
    }
}

/// Lexical signals of one document.
struct DocSignals {
    lower: String,
    token_set: HashSet<String>,
    informative: Vec<String>,
    mentions: HashMap<String, usize>,
    depth: Depth,
}

impl DocSignals {
    fn has_term(&self, term: &str) -> bool {
        self.token_set.contains(term)
            || self.token_set.contains(&format!("{term}s"))
            || term
                .strip_suffix('s')
                .is_some_and(|stem| self.token_set.contains(stem))
            || self.mentions.get(term).is_some_and(|n| *n > 0)
    }

    fn coverage(&self, terms: &BTreeSet<String>) -> Option<f64> {
        if terms.is_empty() {
            return None;
        }
        let hits = terms.iter().filter(|t| self.has_term(t)).count();
        Some(hits as f64 / terms.len() as f64)
    }

    fn mentions_concept(&self, concept: &str) -> bool {
        self.mentions.get(concept).is_some_and(|n| *n > 0)
            || concept_tokens(concept).iter().all(|t| self.has_term(t))
    }

    fn has_marker(&self, markers: &[&str]) -> bool {
        markers.iter().any(|m| self.lower.contains(m))
    }
}

/// Scores candidates against a line, its moment and the user's knowledge.
pub struct RelevanceFilter {
    config: FilterConfig,
    lexicon: Arc<Lexicon>,
}

impl RelevanceFilter {
    pub fn new(config: FilterConfig, lexicon: Arc<Lexicon>) -> Self {
        Self { config, lexicon }
    }

    fn signals(&self, document: &ExtractedDocument) -> DocSignals {
        let text = document.full_text();
        let tokens = tokenize(&text);
        let words = tokens.len().max(1) as f64;
        let technical = tokens
            .iter()
            .filter(|t| TECHNICAL_MARKERS.contains(&t.as_str()))
            .count();
        let intro = tokens
            .iter()
            .filter(|t| INTRO_MARKERS.contains(&t.as_str()))
            .count();
        let rate = technical as f64 * 100.0 / words;
        let depth = if rate >= EXPERT_RATE {
            Depth::Expert
        } else if rate >= TECHNICAL_RATE {
            Depth::Technical
        } else if intro > technical {
            Depth::Introductory
        } else {
            Depth::Intermediate
        };

        DocSignals {
            mentions: self.lexicon.entity_mentions(&text),
            informative: informative_tokens(&text),
            token_set: tokens.into_iter().collect(),
            lower: text.to_lowercase(),
            depth,
        }
    }

    /// Share of the page's most frequent terms that are not already demonstrated.
    fn novelty(&self, doc: &DocSignals, knowledge: &KnowledgeState) -> f64 {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for token in &doc.informative {
            *counts.entry(token.as_str()).or_insert(0) += 1;
        }
        let mut top: Vec<(&str, usize)> = counts.into_iter().collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        top.truncate(NOVELTY_SAMPLE);
        if top.is_empty() {
            return 0.0;
        }

        let known: HashSet<String> = knowledge
            .concepts
            .iter()
            .filter(|(_, r)| r.is_demonstrated())
            .flat_map(|(c, _)| concept_tokens(c))
            .collect();
        let familiar = top.iter().filter(|(t, _)| known.contains(*t)).count();
        1.0 - familiar as f64 / top.len() as f64
    }

    /// Judge one candidate.
    #[instrument(skip_all, fields(url = %candidate.url))]
    pub fn evaluate(
        &self,
        candidate: &Candidate,
        line: &QueryLine,
        moment: Option<&LearningMoment>,
        knowledge: &KnowledgeState,
    ) -> Evaluation {
        let document = &candidate.document;
        if document.is_empty() {
            return Evaluation::rejected(RejectionReason::NoContent, "page has no text".into());
        }
        if knowledge.seen_content.contains(&candidate.content_id) {
            return Evaluation::rejected(
                RejectionReason::AlreadySeen,
                "the user already interacted with this page".into(),
            );
        }

        let doc = self.signals(document);
        let latest = line
            .latest_query()
            .map(|q| self.lexicon.analyze(&q.text).subject_terms())
            .unwrap_or_default();
        let line_terms: BTreeSet<String> = line
            .queries
            .iter()
            .flat_map(|q| self.lexicon.analyze(&q.text).subject_terms())
            .collect();
        let relevance = match (doc.coverage(&latest), doc.coverage(&line_terms)) {
            (Some(q), Some(l)) => 0.6 * q + 0.4 * l,
            (None, Some(l)) => l,
            (Some(q), None) => q,
            (None, None) => 0.0,
        };
        let novelty = self.novelty(&doc, knowledge);
        let sections = relevant_sections(document, &line_terms);
        let title = document
            .metadata
            .title
            .clone()
            .unwrap_or_else(|| candidate.url.clone());
        let focus = if line.current_focus.is_empty() {
            line.refined_topic.clone()
        } else {
            line.current_focus.clone()
        };
        let c = &self.config;

        let evaluation = match moment.map(|m| (m.kind, m)) {
            Some((MomentKind::NewTopicNoContext, _)) => {
                let path_forward = doc.has_marker(PATH_FORWARD_MARKERS);
                if doc.depth == Depth::Expert {
                    Evaluation::rejected(
                        RejectionReason::TooAdvanced,
                        format!("expert-level material for a first look at {focus}"),
                    )
                } else if relevance >= c.no_context_min_relevance
                    || (path_forward && relevance >= c.no_context_path_relevance)
                {
                    let how = if path_forward {
                        "background and a path forward"
                    } else {
                        "background"
                    };
                    Evaluation::kept(
                        format!("\"{title}\" gives {how} on {focus} at a {} level", depth_name(doc.depth)),
                        sections,
                        0.5 * relevance + 0.3 * novelty + if path_forward { 0.2 } else { 0.1 },
                    )
                } else {
                    Evaluation::rejected(
                        RejectionReason::OffTopic,
                        format!("relevance {relevance:.2} below {:.2}", c.no_context_min_relevance),
                    )
                }
            }
            Some((MomentKind::ConceptStruggle, m)) => {
                let target = m.targets.first().map(String::as_str).unwrap_or(focus.as_str());
                let name = self.lexicon.display(target);
                if doc.depth > Depth::Intermediate {
                    Evaluation::rejected(
                        RejectionReason::TooAdvanced,
                        format!("{} material will not untangle {name}", depth_name(doc.depth)),
                    )
                } else if !doc.mentions_concept(target) || relevance < c.struggle_min_relevance {
                    Evaluation::rejected(
                        RejectionReason::DoesNotResolveConfusion,
                        format!("does not address {name} directly (relevance {relevance:.2})"),
                    )
                } else if !doc.has_marker(EXPLANATORY_MARKERS) {
                    Evaluation::rejected(
                        RejectionReason::DoesNotResolveConfusion,
                        format!("covers {name} but offers no examples or analogies"),
                    )
                } else {
                    Evaluation::kept(
                        format!("\"{title}\" explains {name} with examples at an accessible level"),
                        sections,
                        0.5 * relevance + 0.3 * novelty + 0.2,
                    )
                }
            }
            Some((MomentKind::NewTopicWithContext, m)) => {
                if relevance < c.with_context_min_relevance {
                    Evaluation::rejected(
                        RejectionReason::OffTopic,
                        format!("relevance {relevance:.2} below {:.2}", c.with_context_min_relevance),
                    )
                } else if doc.depth == Depth::Introductory {
                    Evaluation::rejected(
                        RejectionReason::TooSuperficial,
                        "introductory material the user has outgrown".into(),
                    )
                } else if novelty < c.novelty_floor {
                    Evaluation::rejected(
                        RejectionReason::Redundant,
                        format!("only {:.0}% of its key terms are new", novelty * 100.0),
                    )
                } else {
                    let prior: Vec<String> =
                        m.targets.iter().map(|t| self.lexicon.display(t)).collect();
                    Evaluation::kept(
                        format!(
                            "\"{title}\" adds new material on {focus} ({:.0}% new) building on {}",
                            novelty * 100.0,
                            prior.join(", ")
                        ),
                        sections,
                        0.5 * relevance + 0.3 * novelty + 0.2 * novelty,
                    )
                }
            }
            Some((MomentKind::GoalDirection, m)) => {
                let Some((direction, siblings)) = m.targets.split_first() else {
                    return Evaluation::rejected(
                        RejectionReason::OffTopic,
                        "no direction to deepen".into(),
                    );
                };
                let name = self.lexicon.display(direction);
                let hits = doc.mentions.get(direction).copied().unwrap_or(0);
                let breadth = siblings
                    .iter()
                    .filter(|s| doc.mentions.get(*s).is_some_and(|n| *n > 0))
                    .count();
                if hits < c.direction_min_mentions {
                    Evaluation::rejected(
                        RejectionReason::OffTopic,
                        format!("mentions {name} {hits} time(s), needs {}", c.direction_min_mentions),
                    )
                } else if breadth > c.direction_max_siblings {
                    Evaluation::rejected(
                        RejectionReason::AddsBreadth,
                        format!("surveys {breadth} other companies instead of deepening {name}"),
                    )
                } else if doc.depth == Depth::Introductory {
                    Evaluation::rejected(
                        RejectionReason::TooSuperficial,
                        format!("an introductory take on {name}"),
                    )
                } else {
                    Evaluation::kept(
                        format!("\"{title}\" goes deeper on {name} ({hits} mentions)"),
                        sections,
                        0.5 * relevance + 0.3 * novelty + 0.2 * (hits as f64 / 5.0).min(1.0),
                    )
                }
            }
            None => {
                if relevance >= c.neutral_min_relevance {
                    Evaluation::kept(
                        format!("\"{title}\" is relevant to {focus}"),
                        sections,
                        0.5 * relevance + 0.3 * novelty + 0.1,
                    )
                } else {
                    Evaluation::rejected(
                        RejectionReason::OffTopic,
                        format!("relevance {relevance:.2} below {:.2}", c.neutral_min_relevance),
                    )
                }
            }
        };

        debug!(
            keep = evaluation.keep,
            reason = ?evaluation.reason,
            relevance,
            novelty,
            depth = ?doc.depth,
            "candidate evaluated"
        );
        evaluation
    }
}

fn depth_name(depth: Depth) -> &'static str {
    match depth {
        Depth::Introductory => "introductory",
        Depth::Intermediate => "intermediate",
        Depth::Technical => "technical",
        Depth::Expert => "expert",
    }
}

/// Titles of the sections that cover the most line terms, best first.
fn relevant_sections(document: &ExtractedDocument, terms: &BTreeSet<String>) -> Vec<String> {
    let mut scored: Vec<(usize, &str)> = document
        .sections
        .iter()
        .map(|s| {
            let tokens: HashSet<String> =
                tokenize(&format!("{} {}", s.title, s.body)).into_iter().collect();
            (terms.iter().filter(|t| tokens.contains(*t)).count(), s.title.as_str())
        })
        .filter(|(score, _)| *score > 0)
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    let mut titles: Vec<String> = scored
        .into_iter()
        .take(MAX_RELEVANT_SECTIONS)
        .map(|(_, t)| t.to_string())
        .collect();
    if titles.is_empty() {
        titles.extend(document.sections.first().map(|s| s.title.clone()));
    }
    titles
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use learnline_shared::{
        ConceptChange, ContentMetadata, ContentSection, GoalFrame, KnowledgeDelta, Query,
    };

    use super::*;

    fn filter() -> RelevanceFilter {
        RelevanceFilter::new(FilterConfig::default(), Arc::new(Lexicon::builtin()))
    }

    fn line_of(texts: &[&str]) -> QueryLine {
        let mut line = QueryLine::open("u1", GoalFrame::Mechanics, Utc::now());
        for text in texts {
            line.queries.push(Query {
                text: text.to_string(),
                response: String::new(),
                citations: vec![],
                asked_at: Utc::now(),
            });
        }
        line.current_focus = "cuda parallelism".into();
        line
    }

    fn candidate(title: &str, sections: &[(&str, &str)]) -> Candidate {
        Candidate {
            content_id: learnline_shared::content_id(title),
            url: format!("https://example.com/{}", title.replace(' ', "-")),
            document: ExtractedDocument {
                sections: sections
                    .iter()
                    .map(|(t, b)| ContentSection {
                        title: t.to_string(),
                        body: b.to_string(),
                    })
                    .collect(),
                metadata: ContentMetadata {
                    title: Some(title.into()),
                    ..ContentMetadata::default()
                },
            },
            query_rank: 0,
            discovery_rank: 0,
        }
    }

    fn moment(kind: MomentKind, targets: &[&str]) -> LearningMoment {
        LearningMoment {
            kind,
            confidence: 0.8,
            reasoning: "test".into(),
            targets: targets.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn knows(concepts: &[&str]) -> KnowledgeState {
        let mut state = KnowledgeState::empty("u1");
        state.merge(&KnowledgeDelta {
            changes: concepts
                .iter()
                .map(|c| ConceptChange {
                    concept: c.to_string(),
                    line_id: None,
                    demonstration_level: 0.5,
                    evidence: vec!["connected".into()],
                    exposures: vec![],
                    confusions: vec![],
                    observed_at: Utc::now(),
                })
                .collect(),
            seen_content: vec![],
        });
        state
    }

    fn gentle_explainer() -> Candidate {
        candidate(
            "CUDA parallelism for everyone",
            &[
                (
                    "The idea",
                    "CUDA parallelism splits one big job into many small ones. Think of a \
                     kitchen with a thousand cooks, each chopping one onion.",
                ),
                (
                    "A worked case",
                    "For example, adding two lists of numbers: every GPU thread adds one pair \
                     at the same time, so parallelism turns a long loop into one quick step.",
                ),
            ],
        )
    }

    fn kernel_paper() -> Candidate {
        candidate(
            "Warp scheduling in CUDA kernels",
            &[(
                "Occupancy",
                "CUDA kernel occupancy depends on warp scheduling, register pressure and \
                 memory bandwidth. Throughput and latency of each warp follow from the \
                 microarchitecture; kernel benchmarks show SIMT divergence costs.",
            )],
        )
    }

    fn path_page() -> Candidate {
        candidate(
            "Getting started with GPU programming",
            &[(
                "Roadmap",
                "Getting started: next steps for learning CUDA. Install the toolkit, run the \
                 samples, then read about parallelism in the programming guide.",
            )],
        )
    }

    #[test]
    fn struggle_keeps_only_explanations_of_the_confusion() {
        let f = filter();
        let line = line_of(&["still confused about CUDA parallelism"]);
        let m = moment(MomentKind::ConceptStruggle, &["cuda parallelism"]);
        let state = KnowledgeState::empty("u1");

        let kept = f.evaluate(&gentle_explainer(), &line, Some(&m), &state);
        assert!(kept.keep, "{}", kept.explanation);
        assert!(kept.explanation.contains("explains cuda parallelism"));
        assert!(!kept.relevant_sections.is_empty());

        let advanced = f.evaluate(&kernel_paper(), &line, Some(&m), &state);
        assert_eq!(advanced.reason, Some(RejectionReason::TooAdvanced));

        let roadmap = f.evaluate(&path_page(), &line, Some(&m), &state);
        assert_eq!(roadmap.reason, Some(RejectionReason::DoesNotResolveConfusion));
    }

    #[test]
    fn no_context_is_more_permissive_than_struggle() {
        let f = filter();
        let line = line_of(&["still confused about CUDA parallelism"]);
        let state = KnowledgeState::empty("u1");
        let struggle = moment(MomentKind::ConceptStruggle, &["cuda parallelism"]);
        let fresh = moment(MomentKind::NewTopicNoContext, &[]);

        for c in [gentle_explainer(), kernel_paper(), path_page()] {
            let strict = f.evaluate(&c, &line, Some(&struggle), &state);
            let loose = f.evaluate(&c, &line, Some(&fresh), &state);
            assert!(!strict.keep || loose.keep, "{} kept only under struggle", c.url);
        }
        // The roadmap page is background with a path forward, not a resolution.
        assert!(f.evaluate(&path_page(), &line, Some(&fresh), &state).keep);
    }

    #[test]
    fn expert_material_is_too_advanced_for_a_new_topic() {
        let line = line_of(&["what is CUDA?"]);
        let eval = filter().evaluate(
            &kernel_paper(),
            &line,
            Some(&moment(MomentKind::NewTopicNoContext, &[])),
            &KnowledgeState::empty("u1"),
        );
        assert_eq!(eval.reason, Some(RejectionReason::TooAdvanced));
        assert!(eval.rejection(&kernel_paper()).is_some());
        assert!(eval.recommendation(&kernel_paper()).is_none());
    }

    #[test]
    fn with_context_rejects_what_is_already_known() {
        let f = filter();
        let line = line_of(&["how do NVIDIA GPUs serve datacenters?"]);
        let m = moment(MomentKind::NewTopicWithContext, &["nvidia"]);
        let repeat = candidate(
            "NVIDIA GPUs in datacenters",
            &[(
                "Datacenters",
                "NVIDIA GPUs datacenters. NVIDIA GPUs datacenters. NVIDIA GPUs serve datacenters.",
            )],
        );

        let state = knows(&["nvidia", "gpus", "datacenters", "serve"]);
        let eval = f.evaluate(&repeat, &line, Some(&m), &state);
        assert_eq!(eval.reason, Some(RejectionReason::Redundant));

        let fresh = f.evaluate(&repeat, &line, Some(&m), &KnowledgeState::empty("u1"));
        assert!(fresh.keep);
        assert!(fresh.explanation.contains("building on NVIDIA"));
    }

    #[test]
    fn direction_rejects_breadth() {
        let f = filter();
        let line = line_of(&["what's NVIDIA's share?", "and AMD's?", "and Intel's?"]);
        let m = moment(MomentKind::GoalDirection, &["nvidia", "amd", "intel"]);
        let state = KnowledgeState::empty("u1");

        let survey = candidate(
            "Chipmakers compared",
            &[(
                "Overview",
                "NVIDIA leads, AMD follows and Intel trails. NVIDIA ships the most units.",
            )],
        );
        assert_eq!(
            f.evaluate(&survey, &line, Some(&m), &state).reason,
            Some(RejectionReason::AddsBreadth)
        );

        let deep = candidate(
            "Inside NVIDIA's data center business",
            &[(
                "Revenue mix",
                "NVIDIA earns most revenue from data center GPUs. NVIDIA bundles software \
                 with its hardware, and NVIDIA networking ties clusters together.",
            )],
        );
        let eval = f.evaluate(&deep, &line, Some(&m), &state);
        assert!(eval.keep, "{}", eval.explanation);
        assert!(eval.explanation.contains("goes deeper on NVIDIA"));
    }

    #[test]
    fn seen_and_empty_pages_are_rejected_first() {
        let f = filter();
        let line = line_of(&["what is CUDA?"]);
        let page = gentle_explainer();
        let mut state = KnowledgeState::empty("u1");
        state.seen_content.insert(page.content_id.clone());

        assert_eq!(
            f.evaluate(&page, &line, None, &state).reason,
            Some(RejectionReason::AlreadySeen)
        );
        let empty = candidate("blank", &[]);
        assert_eq!(
            f.evaluate(&empty, &line, None, &KnowledgeState::empty("u1")).reason,
            Some(RejectionReason::NoContent)
        );
    }
}
