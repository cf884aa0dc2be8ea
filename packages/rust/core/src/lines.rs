//! Query line management: segmenting a user's queries into threads of inquiry.
//!
//! A new query continues the best-scoring active line when its continuity
//! score reaches the configured threshold, and opens a new line otherwise.
//! The score weighs three judgments:
//!
//! - **goal**: does the query pursue the line's goal frame (or one that
//!   extends it) about a linked subject?
//! - **topic**: how much do the query's subject terms overlap the line's?
//! - **building**: does the query phrase itself as building on what came before?
//!
//! Topic and building together stay below the threshold, so a query whose
//! goal does not fit never joins a line on overlap alone.

use std::collections::BTreeSet;
use std::sync::Arc;

use learnline_shared::{GoalFrame, LineConfig, LineId, Query, QueryLine};
use tracing::debug;

use crate::text::{Lexicon, TextProfile, jaccard, sector_tags};

/// Cues that a query builds on the previous ones.
const BUILDING_CUES: &[&str] = &[
    "affecting", "affect", "affects", "impact", "because", "so", "then", "also", "given",
    "this", "that", "those", "these", "still", "again", "further",
];

/// Phrases that announce a change of subject.
const RESTART_CUES: &[&[&str]] = &[
    &["different", "topic"],
    &["unrelated"],
    &["switching"],
    &["by", "the", "way"],
    &["new", "question"],
];

/// How well a query continues a line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContinuityScore {
    pub goal: f64,
    pub topic: f64,
    pub building: f64,
    pub total: f64,
}

/// Outcome of line selection for a new query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LineChoice {
    Continue { line_id: LineId, score: f64 },
    /// No line scored high enough; `best_score` is the closest miss.
    Open { best_score: Option<f64> },
}

/// Terms aggregated over every query of a line.
#[derive(Debug, Default)]
struct LineTerms {
    subject: BTreeSet<String>,
    tags: BTreeSet<String>,
    entities: BTreeSet<String>,
}

impl LineTerms {
    fn all(&self) -> BTreeSet<String> {
        self.subject.union(&self.tags).cloned().collect()
    }
}

/// Owns query line lifecycle: selection, recording, analysis and relations.
pub struct QueryLineManager {
    config: LineConfig,
    lexicon: Arc<Lexicon>,
}

impl QueryLineManager {
    pub fn new(config: LineConfig, lexicon: Arc<Lexicon>) -> Self {
        Self { config, lexicon }
    }

    fn terms(&self, line: &QueryLine) -> LineTerms {
        let mut terms = LineTerms::default();
        for query in &line.queries {
            let profile = self.lexicon.analyze(&query.text);
            terms.subject.extend(profile.subject_terms());
            terms.tags.extend(sector_tags(&profile.sectors));
            terms.entities.extend(profile.entities.iter().cloned());
        }
        terms
    }

    /// Continuity of `query` with `line`.
    pub fn score(&self, line: &QueryLine, query: &str) -> ContinuityScore {
        let profile = self.lexicon.analyze(query);
        self.score_profile(&self.terms(line), line.goal, &profile)
    }

    fn score_profile(
        &self,
        terms: &LineTerms,
        goal: GoalFrame,
        profile: &TextProfile,
    ) -> ContinuityScore {
        let subject = profile.subject_terms();
        let link = if subject.is_empty() {
            0.5
        } else if profile.entities.iter().any(|e| terms.entities.contains(e))
            || sector_tags(&profile.sectors).any(|t| terms.tags.contains(&t))
        {
            1.0
        } else if subject.iter().any(|t| terms.subject.contains(t)) {
            0.6
        } else {
            0.0
        };
        let goal = frame_affinity(goal, profile.frame) * link;
        let topic = jaccard(&profile.term_set(), &terms.all());
        let building = building_signal(profile);

        ContinuityScore {
            goal,
            topic,
            building,
            total: self.config.goal_weight * goal
                + self.config.topic_weight * topic
                + self.config.building_weight * building,
        }
    }

    /// Pick the active line `query` continues, if any.
    ///
    /// Equal scores go to the most recently active line.
    pub fn choose(&self, lines: &[QueryLine], query: &str) -> LineChoice {
        let profile = self.lexicon.analyze(query);
        let mut best: Option<(&QueryLine, f64)> = None;

        for line in lines.iter().filter(|l| l.active && !l.queries.is_empty()) {
            let score = self
                .score_profile(&self.terms(line), line.goal, &profile)
                .total;
            debug!(line_id = %line.id, score, "continuity score");
            let better = match best {
                None => true,
                Some((current, current_score)) => {
                    score > current_score
                        || (score == current_score && line.last_active_at > current.last_active_at)
                }
            };
            if better {
                best = Some((line, score));
            }
        }

        match best {
            Some((line, score)) if score >= self.config.continuation_threshold => {
                LineChoice::Continue {
                    line_id: line.id,
                    score,
                }
            }
            other => LineChoice::Open {
                best_score: other.map(|(_, score)| score),
            },
        }
    }

    /// Open a new line for `user_id` seeded with `query`.
    pub fn open(&self, user_id: &str, query: Query) -> QueryLine {
        let frame = self.lexicon.analyze(&query.text).frame;
        let mut line = QueryLine::open(user_id, frame, query.asked_at);
        self.record(&mut line, query);
        line
    }

    /// Append `query` to `line` and refresh the line's analysis.
    pub fn record(&self, line: &mut QueryLine, query: Query) {
        let frame = self.lexicon.analyze(&query.text).frame;
        if line.goal == GoalFrame::General && frame != GoalFrame::General {
            line.goal = frame;
        }
        if query.asked_at > line.last_active_at {
            line.last_active_at = query.asked_at;
        }
        line.queries.push(query);
        self.refresh_analysis(line);
    }

    /// Choose a line for `query` among `lines` and record it there.
    ///
    /// Returns the id of the line the query landed in.
    pub fn assign(&self, user_id: &str, lines: &mut Vec<QueryLine>, query: Query) -> LineId {
        match self.choose(lines, &query.text) {
            LineChoice::Continue { line_id, .. } => {
                if let Some(line) = lines.iter_mut().find(|l| l.id == line_id) {
                    self.record(line, query);
                }
                line_id
            }
            LineChoice::Open { .. } => {
                let line = self.open(user_id, query);
                let id = line.id;
                lines.push(line);
                id
            }
        }
    }

    /// Lines among the `limit` most recently active `candidates` whose
    /// understanding would inform `line`. Inactive lines qualify.
    pub fn find_related(
        &self,
        line: &QueryLine,
        candidates: &[QueryLine],
        limit: usize,
    ) -> BTreeSet<LineId> {
        let mine = self.terms(line);
        let mut others: Vec<&QueryLine> = candidates
            .iter()
            .filter(|l| l.id != line.id && !l.queries.is_empty())
            .collect();
        others.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        others.truncate(limit);

        others
            .into_iter()
            .filter(|other| {
                let theirs = self.terms(other);
                let score = if mine.entities.intersection(&theirs.entities).next().is_some() {
                    1.0
                } else if mine.tags.intersection(&theirs.tags).next().is_some() {
                    0.5
                } else {
                    jaccard(&mine.subject, &theirs.subject)
                };
                score >= self.config.relation_threshold
            })
            .map(|other| other.id)
            .collect()
    }

    /// Recompute refined topic, inferred goal, focus and progression from the whole line.
    fn refresh_analysis(&self, line: &mut QueryLine) {
        let profiles: Vec<TextProfile> = line
            .queries
            .iter()
            .map(|q| self.lexicon.analyze(&q.text))
            .collect();
        let Some(first) = profiles.first() else {
            return;
        };

        // Entities first, then concepts by frequency, first-seen order on ties.
        let mut counts: Vec<(String, usize, bool)> = Vec::new();
        for profile in &profiles {
            for concept in &profile.concepts {
                let is_entity = profile.entities.contains(concept);
                match counts.iter_mut().find(|(c, _, _)| c == concept) {
                    Some(entry) => entry.1 += 1,
                    None => counts.push((concept.clone(), 1, is_entity)),
                }
            }
        }
        counts.sort_by(|a, b| b.2.cmp(&a.2).then(b.1.cmp(&a.1)));
        let topic: Vec<String> = counts
            .iter()
            .take(3)
            .map(|(c, _, _)| self.lexicon.display(c))
            .collect();
        if !topic.is_empty() {
            line.refined_topic = topic.join(", ");
        }

        let subject = first
            .entities
            .first()
            .or_else(|| first.concepts.first())
            .map(|c| self.lexicon.display(c))
            .unwrap_or_else(|| line.refined_topic.clone());
        line.inferred_goal = goal_statement(line.goal, &subject);

        let focus_of = |profile: &TextProfile| -> String {
            if profile.concepts.is_empty() {
                subject.clone()
            } else {
                profile
                    .concepts
                    .iter()
                    .map(|c| self.lexicon.display(c))
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        };

        if let Some(latest) = profiles.last() {
            line.current_focus = focus_of(latest);
        }

        let mut steps: Vec<String> = Vec::new();
        for profile in &profiles {
            let step = format!("{} ({})", focus_of(profile), profile.frame.describe());
            if steps.last() != Some(&step) {
                steps.push(step);
            }
        }
        line.learning_progression = format!(
            "{} quer{}: {}",
            profiles.len(),
            if profiles.len() == 1 { "y" } else { "ies" },
            steps.join(" -> ")
        );
    }
}

/// How strongly a query frame serves a line's goal frame.
fn frame_affinity(line_goal: GoalFrame, frame: GoalFrame) -> f64 {
    use GoalFrame::*;
    if line_goal == frame {
        return 1.0;
    }
    match (line_goal, frame) {
        (General, _) | (_, General) => 0.5,
        (MarketPosition, DemandDrivers | Competition | Financials | Outlook) => 0.8,
        (MarketSize, DemandDrivers | Outlook) => 0.8,
        (DemandDrivers, MarketSize | Outlook) => 0.8,
        (Competition, MarketPosition | Financials) => 0.8,
        (Financials, MarketPosition | Outlook) => 0.8,
        (Outlook, DemandDrivers | MarketSize) => 0.8,
        (_, Mechanics) => 0.6,
        _ => 0.0,
    }
}

fn building_signal(profile: &TextProfile) -> f64 {
    let restarts = RESTART_CUES.iter().any(|cue| {
        profile
            .tokens
            .windows(cue.len())
            .any(|w| w.iter().zip(cue.iter()).all(|(a, b)| a == b))
    });
    if restarts {
        0.0
    } else if profile.has_cue(BUILDING_CUES) {
        1.0
    } else {
        0.5
    }
}

fn goal_statement(frame: GoalFrame, subject: &str) -> String {
    match frame {
        GoalFrame::MarketPosition => format!("understand {subject}'s market position"),
        GoalFrame::MarketSize => format!("understand how big the {subject} market is"),
        GoalFrame::DemandDrivers => format!("understand what drives demand for {subject}"),
        GoalFrame::Competition => format!("understand the competitive landscape around {subject}"),
        GoalFrame::Financials => format!("understand {subject}'s financial performance"),
        GoalFrame::Outlook => format!("understand where {subject} is heading"),
        GoalFrame::Mechanics => format!("understand how {subject} works"),
        GoalFrame::General => format!("learn about {subject}"),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    fn manager() -> QueryLineManager {
        QueryLineManager::new(LineConfig::default(), Arc::new(Lexicon::builtin()))
    }

    fn query(text: &str, minutes: i64) -> Query {
        Query {
            text: text.into(),
            response: String::new(),
            citations: vec![],
            asked_at: Utc::now() + Duration::minutes(minutes),
        }
    }

    #[test]
    fn same_subject_different_goal_opens_new_line() {
        let mgr = manager();
        let mut lines = Vec::new();
        let first = mgr.assign("u1", &mut lines, query("what's NVIDIA's AI chip market share?", 0));
        let second = mgr.assign("u1", &mut lines, query("how big is the total AI chip market?", 1));

        assert_ne!(first, second);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].goal, GoalFrame::MarketPosition);
        assert_eq!(lines[1].goal, GoalFrame::MarketSize);
    }

    #[test]
    fn different_topic_same_goal_continues_line() {
        let mgr = manager();
        let mut lines = Vec::new();
        let first = mgr.assign("u1", &mut lines, query("what's NVIDIA's market share?", 0));
        let second = mgr.assign(
            "u1",
            &mut lines,
            query("how are cloud providers affecting chip demand?", 1),
        );

        assert_eq!(first, second);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].queries.len(), 2);
        assert_eq!(lines[0].inferred_goal, "understand NVIDIA's market position");
        assert_eq!(lines[0].current_focus, "cloud providers, chip");
    }

    #[test]
    fn topic_overlap_alone_never_merges() {
        let mgr = manager();
        let mut line = mgr.open("u1", query("what's NVIDIA's AI chip market share?", 0));
        line.queries.push(query("NVIDIA AI chip market share", 1));

        // Identical subject, disjoint goal: at most the topic and building weights.
        let score = mgr.score(&line, "how big is the total NVIDIA AI chip market? because");
        assert_eq!(score.goal, 0.0);
        assert!(score.total < LineConfig::default().continuation_threshold);
    }

    #[test]
    fn repeated_confusion_stays_in_one_line() {
        let mgr = manager();
        let mut lines = Vec::new();
        let ids: Vec<LineId> = [
            "how does CUDA parallelism work?",
            "still confused about CUDA parallelism",
            "I still don't understand CUDA parallelism",
        ]
        .iter()
        .enumerate()
        .map(|(i, text)| mgr.assign("u1", &mut lines, query(text, i as i64)))
        .collect();

        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(lines[0].inferred_goal, "understand how cuda parallelism works");
    }

    #[test]
    fn inactive_lines_are_not_continued() {
        let mgr = manager();
        let mut lines = Vec::new();
        mgr.assign("u1", &mut lines, query("what's NVIDIA's market share?", 0));
        lines[0].active = false;

        let choice = mgr.choose(&lines, "what's NVIDIA's market share now?");
        assert!(matches!(choice, LineChoice::Open { .. }));
    }

    #[test]
    fn ties_prefer_most_recent_line() {
        let mgr = manager();
        let a = mgr.open("u1", query("what's NVIDIA's market share?", 0));
        let mut b = a.clone();
        b.id = LineId::new();
        b.last_active_at = a.last_active_at + Duration::minutes(5);

        match mgr.choose(&[a, b.clone()], "what's NVIDIA's market share?") {
            LineChoice::Continue { line_id, .. } => assert_eq!(line_id, b.id),
            other => panic!("expected continuation, got {other:?}"),
        }
    }

    #[test]
    fn related_lines_share_entities_or_sectors() {
        let mgr = manager();
        let nvidia = mgr.open("u1", query("how does NVIDIA's CUDA moat work?", 0));
        let ev_chips = mgr.open("u1", query("which chips power Tesla's self-driving?", 1));
        let pizza = mgr.open("u1", query("best neapolitan pizza dough hydration", 2));

        let related = mgr.find_related(&ev_chips, &[nvidia.clone(), pizza.clone()], 20);
        assert!(related.contains(&nvidia.id));
        assert!(!related.contains(&pizza.id));

        // The candidate set is bounded to the most recent lines.
        let bounded = mgr.find_related(&ev_chips, &[nvidia, pizza], 1);
        assert!(bounded.is_empty());
    }

    #[test]
    fn progression_tracks_focus_changes() {
        let mgr = manager();
        let mut line = mgr.open("u1", query("what's NVIDIA's market share?", 0));
        mgr.record(&mut line, query("how are cloud providers affecting chip demand?", 1));

        assert!(line.learning_progression.starts_with("2 queries: NVIDIA (market position)"));
        assert!(line.learning_progression.contains("-> cloud providers, chip (demand drivers)"));
        assert_eq!(line.refined_topic, "NVIDIA, cloud providers, chip");
    }
}
