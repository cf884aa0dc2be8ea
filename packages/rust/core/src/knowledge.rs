//! Knowledge state tracking: exposure versus demonstration.
//!
//! The tracker never mutates a [`KnowledgeState`]. It proposes a
//! [`KnowledgeDelta`] that the caller merges, so levels only move through
//! `max` merges and the explicit reset.

use std::collections::BTreeMap;
use std::sync::Arc;

use learnline_shared::{
    ConceptChange, ConceptRecord, GoalFrame, Interaction, InteractionKind, KnowledgeDelta,
    KnowledgeState, KnowledgeView, LearningPath, Query, QueryLine,
};
use tracing::debug;

use crate::text::{Lexicon, TextProfile, excerpt, informative_tokens, same_concept};

const CONNECTION_CUES: &[&str] = &[
    "because", "affect", "affects", "affecting", "impact", "impacts", "drive", "drives",
    "driving", "between", "relate", "related", "relationship", "link", "linked", "therefore",
    "so", "versus", "vs",
];
const CHALLENGE_CUES: &[&str] = &[
    "but", "however", "isnt", "doesnt", "really", "actually", "wrong", "overstated",
];
const APPLICATION_CUES: &[&str] = &[
    "if", "would", "apply", "applied", "given", "suppose", "assuming", "scenario",
];

const CONNECTION_GAIN: f64 = 0.2;
const CHALLENGE_GAIN: f64 = 0.25;
const APPLICATION_GAIN: f64 = 0.25;
const REUSE_GAIN: f64 = 0.15;

const MAX_RESPONSE_EXPOSURES: usize = 10;
const MAX_GAPS: usize = 5;
const MAX_NEXT_TOPICS: usize = 3;
const EXCERPT_CHARS: usize = 80;

/// Derives knowledge deltas from queries, responses and interactions.
pub struct KnowledgeStateTracker {
    lexicon: Arc<Lexicon>,
}

impl KnowledgeStateTracker {
    pub fn new(lexicon: Arc<Lexicon>) -> Self {
        Self { lexicon }
    }

    /// Delta for one recorded `query` (with its response) on `line`.
    ///
    /// Query concepts are demonstrated when the user's own wording connects,
    /// challenges, applies or reuses them. Concepts introduced by the response
    /// are recorded as exposures at level 0.
    pub fn update(&self, state: &KnowledgeState, line: &QueryLine, query: &Query) -> KnowledgeDelta {
        let profile = self.lexicon.analyze(&query.text);
        let quoted = format!("\"{}\"", excerpt(&query.text, EXCERPT_CHARS));
        let mut changes = Vec::new();

        for concept in &profile.concepts {
            let current = state.level(concept);
            let mut change = ConceptChange {
                concept: concept.clone(),
                line_id: Some(line.id),
                demonstration_level: current,
                evidence: Vec::new(),
                exposures: Vec::new(),
                confusions: Vec::new(),
                observed_at: query.asked_at,
            };

            if profile.confused {
                change.confusions.push(query.text.clone());
            } else {
                let gains = self.demonstration_cues(state, &profile, concept);
                let mut level = current;
                for (kind, gain) in gains {
                    level += gain;
                    change.evidence.push(format!("{kind} {quoted}"));
                }
                change.demonstration_level = level.min(1.0);
            }
            if change.evidence.is_empty() && change.confusions.is_empty() {
                change.exposures.push(format!("asked about in {quoted}"));
            }
            changes.push(change);
        }

        for concept in self.response_concepts(state, &profile, &query.response) {
            changes.push(ConceptChange {
                concept,
                line_id: Some(line.id),
                demonstration_level: 0.0,
                evidence: Vec::new(),
                exposures: vec![format!("mentioned in the answer to {quoted}")],
                confusions: Vec::new(),
                observed_at: query.asked_at,
            });
        }

        debug!(
            concepts = profile.concepts.len(),
            demonstrated = changes.iter().filter(|c| c.raised_level()).count(),
            "knowledge delta"
        );
        KnowledgeDelta {
            changes,
            seen_content: Vec::new(),
        }
    }

    fn demonstration_cues(
        &self,
        state: &KnowledgeState,
        profile: &TextProfile,
        concept: &str,
    ) -> Vec<(&'static str, f64)> {
        let mut cues = Vec::new();
        if profile.concepts.len() >= 2 && profile.has_cue(CONNECTION_CUES) {
            cues.push(("connected to related concepts in", CONNECTION_GAIN));
        }
        if profile.has_cue(CHALLENGE_CUES) {
            cues.push(("challenged a claim in", CHALLENGE_GAIN));
        }
        if profile.has_cue(APPLICATION_CUES) {
            cues.push(("applied to a scenario in", APPLICATION_GAIN));
        }
        // Naming an exposed concept only counts once the query does something with it.
        let previously_exposed = state
            .concepts
            .get(concept)
            .is_some_and(|r| !r.exposures.is_empty());
        if previously_exposed && (!cues.is_empty() || !profile.is_definitional()) {
            cues.push(("reused after exposure in", REUSE_GAIN));
        }
        cues
    }

    /// Concepts a response introduces that the query itself did not name.
    fn response_concepts(
        &self,
        state: &KnowledgeState,
        profile: &TextProfile,
        response: &str,
    ) -> Vec<String> {
        if response.trim().is_empty() {
            return Vec::new();
        }
        let answer = self.lexicon.analyze(response);
        answer
            .concepts
            .into_iter()
            .filter(|c| !profile.concepts.iter().any(|q| same_concept(q, c)))
            .filter(|c| {
                answer.entities.contains(c)
                    || state.concepts.contains_key(c)
                    || c.split(' ').any(|t| self.lexicon.sector_of(t).is_some())
            })
            .take(MAX_RESPONSE_EXPOSURES)
            .collect()
    }

    /// Demonstrated and exposed concepts relevant to `topic` (all concepts when empty).
    pub fn snapshot(&self, state: &KnowledgeState, topic: &str) -> KnowledgeView {
        let topic_profile = self.lexicon.analyze(topic);
        let topic_tokens = informative_tokens(topic);
        let relevant = |concept: &str| {
            topic.trim().is_empty()
                || topic_profile.concepts.iter().any(|t| same_concept(t, concept))
                || concept.split(' ').any(|t| topic_tokens.iter().any(|x| x == t))
        };

        let mut view = KnowledgeView {
            topic: topic.to_string(),
            ..KnowledgeView::default()
        };
        for (concept, record) in &state.concepts {
            if !relevant(concept.as_str()) {
                continue;
            }
            let target = if record.is_demonstrated() {
                &mut view.demonstrated
            } else {
                &mut view.exposed
            };
            target.insert(concept.clone(), record.clone());
        }
        view
    }

    /// Recompute a line's knowledge gaps and next suggested topics.
    ///
    /// Gaps the latest query addressed (or that are now demonstrated) are
    /// dropped; exposed-only subtopics and confusions on this line are added.
    /// Next topics build only on concepts demonstrated on this line.
    pub fn gaps_and_next_topics(&self, line: &QueryLine, state: &KnowledgeState) -> LearningPath {
        let latest = line
            .latest_query()
            .map(|q| self.lexicon.analyze(&q.text));
        let addressed = |gap: &str| {
            latest.as_ref().is_some_and(|p| {
                !p.confused && p.concepts.iter().any(|c| same_concept(c, gap))
            })
        };

        let line_records: BTreeMap<&String, &ConceptRecord> = state
            .concepts
            .iter()
            .filter(|(_, r)| r.line_ids.contains(&line.id))
            .collect();

        let mut gaps: Vec<String> = Vec::new();

        for gap in &line.learning_path.knowledge_gaps {
            let key = gap.to_lowercase();
            if addressed(&key) || state.level(&key) > 0.0 {
                continue;
            }
            push_gap(&mut gaps, &key);
        }
        for (concept, record) in &line_records {
            let open = !addressed(concept.as_str());
            let confused = !record.confusions.is_empty();
            let surfaced = !record.is_demonstrated() && !record.exposures.is_empty();
            if open && (confused || surfaced) {
                push_gap(&mut gaps, concept.as_str());
            }
        }
        gaps.truncate(MAX_GAPS);

        let mut demonstrated: Vec<(&String, &ConceptRecord)> = line_records
            .into_iter()
            .filter(|(c, r)| r.is_demonstrated() && !gaps.contains(*c))
            .collect();
        demonstrated.sort_by(|a, b| b.1.demonstration_level.total_cmp(&a.1.demonstration_level));
        let next_suggested_topics = demonstrated
            .into_iter()
            .take(MAX_NEXT_TOPICS)
            .map(|(c, _)| next_topic(line.goal, &self.lexicon.display(c)))
            .collect();

        LearningPath {
            knowledge_gaps: gaps.iter().map(|g| self.lexicon.display(g)).collect(),
            next_suggested_topics,
        }
    }

    /// Fold interactions into a delta: highlights become exposures and every
    /// touched content id is marked seen.
    pub fn apply_interactions(&self, interactions: &[Interaction]) -> KnowledgeDelta {
        let mut delta = KnowledgeDelta::default();
        for interaction in interactions {
            if !delta.seen_content.contains(&interaction.content_id) {
                delta.seen_content.push(interaction.content_id.clone());
            }
            let InteractionKind::Highlight {
                highlighted_text, ..
            } = &interaction.kind
            else {
                continue;
            };
            let snippet = format!("highlighted \"{}\"", excerpt(highlighted_text, EXCERPT_CHARS));
            for concept in self.lexicon.analyze(highlighted_text).concepts {
                delta.changes.push(ConceptChange {
                    concept,
                    line_id: None,
                    demonstration_level: 0.0,
                    evidence: Vec::new(),
                    exposures: vec![snippet.clone()],
                    confusions: Vec::new(),
                    observed_at: interaction.timestamp,
                });
            }
        }
        delta
    }
}

fn push_gap(gaps: &mut Vec<String>, concept: &str) {
    if !gaps.iter().any(|g| g == concept) {
        gaps.push(concept.to_string());
    }
}

fn next_topic(frame: GoalFrame, concept: &str) -> String {
    match frame {
        GoalFrame::MarketPosition | GoalFrame::Competition => {
            format!("how {concept} compares with competitors")
        }
        GoalFrame::MarketSize | GoalFrame::DemandDrivers => {
            format!("what drives growth in {concept}")
        }
        GoalFrame::Financials => format!("{concept} margins and unit economics"),
        GoalFrame::Outlook => format!("long-term risks for {concept}"),
        GoalFrame::Mechanics => format!("advanced applications of {concept}"),
        GoalFrame::General => format!("{concept} in practice"),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use learnline_shared::LineConfig;

    use super::*;
    use crate::lines::QueryLineManager;

    fn lexicon() -> Arc<Lexicon> {
        Arc::new(Lexicon::builtin())
    }

    fn query(text: &str, response: &str, minutes: i64) -> Query {
        Query {
            text: text.into(),
            response: response.into(),
            citations: vec![],
            asked_at: Utc::now() + Duration::minutes(minutes),
        }
    }

    /// Record `q` on `line` and merge the tracker's delta into `state`.
    fn step(
        lines: &QueryLineManager,
        tracker: &KnowledgeStateTracker,
        state: &mut KnowledgeState,
        line: &mut QueryLine,
        q: Query,
    ) {
        lines.record(line, q.clone());
        let delta = tracker.update(state, line, &q);
        state.merge(&delta);
        line.learning_path = tracker.gaps_and_next_topics(line, state);
    }

    #[test]
    fn connection_demonstrates_and_answers_only_expose() {
        let tracker = KnowledgeStateTracker::new(lexicon());
        let lines = QueryLineManager::new(LineConfig::default(), lexicon());
        let q = query(
            "how are cloud providers affecting chip demand?",
            "Hyperscalers like Microsoft and Amazon buy GPUs from NVIDIA.",
            0,
        );
        let line = lines.open("u1", q.clone());
        let mut state = KnowledgeState::empty("u1");
        state.merge(&tracker.update(&state, &line, &q));

        assert!(state.level("cloud providers") > 0.0);
        assert!(state.level("chip") > 0.0);
        assert!(state.concepts["chip"].evidence[0].starts_with("connected"));

        let microsoft = &state.concepts["microsoft"];
        assert_eq!(microsoft.demonstration_level, 0.0);
        assert!(!microsoft.exposures.is_empty());
        assert!(microsoft.line_ids.contains(&line.id));
    }

    #[test]
    fn confusion_never_raises_level() {
        let tracker = KnowledgeStateTracker::new(lexicon());
        let lines = QueryLineManager::new(LineConfig::default(), lexicon());
        let q = query("I still don't understand CUDA parallelism, but why?", "", 0);
        let line = lines.open("u1", q.clone());
        let state = KnowledgeState::empty("u1");

        let delta = tracker.update(&state, &line, &q);
        let change = &delta.changes[0];
        assert_eq!(change.concept, "cuda parallelism");
        assert_eq!(change.demonstration_level, 0.0);
        assert_eq!(change.confusions.len(), 1);
        assert_eq!(delta.demonstrated().count(), 0);
    }

    #[test]
    fn levels_never_decrease_across_updates() {
        let tracker = KnowledgeStateTracker::new(lexicon());
        let lines = QueryLineManager::new(LineConfig::default(), lexicon());
        let first = query("what if TSMC raised wafer prices?", "Foundry margins would rise.", 0);
        let mut line = lines.open("u1", first.clone());
        let mut state = KnowledgeState::empty("u1");
        state.merge(&tracker.update(&state, &line, &first));
        let mut previous = state.level("tsmc");
        assert!(previous > 0.0);

        for (i, text) in [
            "what is TSMC",
            "I'm confused about TSMC",
            "but is TSMC really a monopoly?",
        ]
        .iter()
        .enumerate()
        {
            step(&lines, &tracker, &mut state, &mut line, query(text, "", i as i64 + 1));
            let level = state.level("tsmc");
            assert!(level >= previous, "{text}: {level} < {previous}");
            previous = level;
        }
    }

    #[test]
    fn reuse_after_exposure_counts_as_demonstration() {
        let tracker = KnowledgeStateTracker::new(lexicon());
        let lines = QueryLineManager::new(LineConfig::default(), lexicon());
        let first = query("how does NVIDIA sell GPUs?", "Most revenue comes from datacenters.", 0);
        let mut line = lines.open("u1", first.clone());
        let mut state = KnowledgeState::empty("u1");
        state.merge(&tracker.update(&state, &line, &first));
        assert_eq!(state.level("datacenters"), 0.0);

        step(
            &lines,
            &tracker,
            &mut state,
            &mut line,
            query("are datacenters growing?", "", 1),
        );
        assert!(state.level("datacenters") > 0.0);
    }

    #[test]
    fn asking_what_an_exposed_concept_is_does_not_demonstrate_it() {
        let tracker = KnowledgeStateTracker::new(lexicon());
        let lines = QueryLineManager::new(LineConfig::default(), lexicon());
        let first = query("how does NVIDIA sell GPUs?", "Most revenue comes from datacenters.", 0);
        let mut line = lines.open("u1", first.clone());
        let mut state = KnowledgeState::empty("u1");
        state.merge(&tracker.update(&state, &line, &first));

        step(
            &lines,
            &tracker,
            &mut state,
            &mut line,
            query("what are datacenters?", "", 1),
        );
        assert_eq!(state.level("datacenters"), 0.0);
        assert!(state.concepts["datacenters"].evidence.is_empty());

        step(
            &lines,
            &tracker,
            &mut state,
            &mut line,
            query("what would happen to datacenters if prices rose?", "", 2),
        );
        let evidence = &state.concepts["datacenters"].evidence;
        assert!(evidence.iter().any(|e| e.starts_with("applied")));
        assert!(evidence.iter().any(|e| e.starts_with("reused")));
    }

    #[test]
    fn gaps_close_and_next_topics_build_on_demonstrated() {
        let tracker = KnowledgeStateTracker::new(lexicon());
        let lines = QueryLineManager::new(LineConfig::default(), lexicon());
        let first = query(
            "how are cloud providers affecting chip demand?",
            "Microsoft leads hyperscaler spending.",
            0,
        );
        let mut line = lines.open("u1", first.clone());
        let mut state = KnowledgeState::empty("u1");
        state.merge(&tracker.update(&state, &line, &first));
        line.learning_path = tracker.gaps_and_next_topics(&line, &state);

        assert!(line.learning_path.knowledge_gaps.contains(&"Microsoft".to_string()));
        assert!(
            line.learning_path
                .next_suggested_topics
                .iter()
                .all(|t| !t.contains("Microsoft"))
        );
        assert!(!line.learning_path.next_suggested_topics.is_empty());

        step(
            &lines,
            &tracker,
            &mut state,
            &mut line,
            query("how much does Microsoft spend?", "", 1),
        );
        assert!(!line.learning_path.knowledge_gaps.contains(&"Microsoft".to_string()));
    }

    #[test]
    fn snapshot_splits_demonstrated_from_exposed() {
        let tracker = KnowledgeStateTracker::new(lexicon());
        let lines = QueryLineManager::new(LineConfig::default(), lexicon());
        let q = query(
            "how are cloud providers affecting chip demand?",
            "Microsoft leads hyperscaler spending.",
            0,
        );
        let line = lines.open("u1", q.clone());
        let mut state = KnowledgeState::empty("u1");
        state.merge(&tracker.update(&state, &line, &q));

        let view = tracker.snapshot(&state, "");
        assert!(view.demonstrated.contains_key("chip"));
        assert!(view.exposed.contains_key("microsoft"));

        let chips = tracker.snapshot(&state, "chip supply");
        assert!(chips.demonstrated.contains_key("chip"));
        assert!(!chips.exposed.contains_key("microsoft"));
    }

    #[test]
    fn interactions_mark_seen_and_expose_highlights() {
        let tracker = KnowledgeStateTracker::new(lexicon());
        let now = Utc::now();
        let interactions = vec![
            Interaction {
                user_id: "u1".into(),
                content_id: "c1".into(),
                kind: InteractionKind::ReadStart { section: None },
                timestamp: now,
            },
            Interaction {
                user_id: "u1".into(),
                content_id: "c1".into(),
                kind: InteractionKind::Highlight {
                    highlighted_text: "TSMC fabricates chips for NVIDIA".into(),
                    surrounding_context: None,
                },
                timestamp: now,
            },
        ];

        let delta = tracker.apply_interactions(&interactions);
        assert_eq!(delta.seen_content, vec!["c1"]);
        assert!(delta.changes.iter().any(|c| c.concept == "tsmc"));
        assert_eq!(delta.demonstrated().count(), 0);

        let mut state = KnowledgeState::empty("u1");
        state.merge(&delta);
        assert!(state.seen_content.contains("c1"));
        assert_eq!(state.level("nvidia"), 0.0);

        // The whole history is folded again on every run.
        let version = state.version;
        assert!(!state.merge(&tracker.apply_interactions(&interactions)));
        assert_eq!(state.version, version);
    }
}
