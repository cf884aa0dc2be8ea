//! Learning-moment classification.
//!
//! The four moments are not independent scores: they are evaluated as an
//! ordered rule table and the first rule that fires with enough confidence
//! wins. When none fires the line gets no moment and downstream stages use
//! neutral shaping.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use learnline_shared::{
    KnowledgeState, LearningMoment, LineId, MomentConfig, MomentKind, QueryLine,
};
use tracing::debug;

use crate::text::{Lexicon, TextProfile, excerpt, jaccard, same_concept};

/// Response phrases that show a systematic framework was already supplied.
const FRAMEWORK_MARKERS: &[&str] = &[
    "framework",
    "checklist",
    "step-by-step",
    "step by step",
    "criteria",
    "methodology",
];

/// Queries a breadth-without-depth line must span.
const MIN_BREADTH_QUERIES: usize = 3;

/// Token overlap at which a query counts as a repeat rather than a new attempt.
const REPEAT_SIMILARITY: f64 = 0.8;

type Rule = fn(&MomentClassifier, &LineEvidence<'_>) -> Option<LearningMoment>;

/// Ordered rule table: most specific first.
const RULES: &[(MomentKind, Rule)] = &[
    (MomentKind::ConceptStruggle, MomentClassifier::struggle),
    (MomentKind::GoalDirection, MomentClassifier::goal_direction),
    (MomentKind::NewTopicNoContext, MomentClassifier::no_context),
    (MomentKind::NewTopicWithContext, MomentClassifier::with_context),
];

/// Everything the rules look at, computed once per classification.
struct LineEvidence<'a> {
    line: &'a QueryLine,
    knowledge: &'a KnowledgeState,
    profiles: Vec<TextProfile>,
}

impl LineEvidence<'_> {
    fn line_concepts(&self) -> BTreeSet<&str> {
        self.profiles
            .iter()
            .flat_map(|p| p.concepts.iter().map(String::as_str))
            .collect()
    }

    /// Concepts demonstrated by this line's own queries, once the line has history.
    fn own_knowledge(&self) -> Vec<&str> {
        if self.line.queries.len() <= 1 {
            return Vec::new();
        }
        self.knowledge
            .concepts
            .iter()
            .filter(|(_, r)| r.level_on(self.line.id) > 0.0)
            .map(|(c, _)| c.as_str())
            .collect()
    }

    /// Concepts demonstrated somewhere other than this line that bear on it:
    /// demonstrated on a related line, or naming one of this line's concepts.
    ///
    /// Being mentioned on this line does not disqualify a concept; only a
    /// demonstration elsewhere counts. Returns the best level reached elsewhere.
    fn transferable_knowledge(&self) -> Vec<(&str, f64)> {
        let concepts = self.line_concepts();
        let mut transferable = Vec::new();
        for (concept, record) in &self.knowledge.concepts {
            if !record.is_demonstrated() {
                continue;
            }
            // Records demonstrated without any line keep their overall level.
            let elsewhere: Vec<(LineId, f64)> =
                record.demonstrated_elsewhere(self.line.id).collect();
            if elsewhere.is_empty() && !record.line_levels.is_empty() {
                continue;
            }
            let on_related = elsewhere
                .iter()
                .any(|(id, _)| self.line.related_line_ids.contains(id));
            let named_here = concepts.iter().any(|own| same_concept(own, concept));
            if !on_related && !named_here {
                continue;
            }
            let level = elsewhere
                .iter()
                .map(|(_, level)| *level)
                .reduce(f64::max)
                .unwrap_or(record.demonstration_level);
            transferable.push((concept.as_str(), level));
        }
        transferable
    }
}

/// Labels a query line with its current learning moment.
pub struct MomentClassifier {
    config: MomentConfig,
    lexicon: Arc<Lexicon>,
}

impl MomentClassifier {
    pub fn new(config: MomentConfig, lexicon: Arc<Lexicon>) -> Self {
        Self { config, lexicon }
    }

    /// Classify `line` against the user's knowledge.
    ///
    /// Returns `None` when no rule fires at or above the minimum confidence.
    pub fn classify(&self, line: &QueryLine, knowledge: &KnowledgeState) -> Option<LearningMoment> {
        if line.queries.is_empty() {
            return None;
        }
        let evidence = LineEvidence {
            line,
            knowledge,
            profiles: line
                .queries
                .iter()
                .map(|q| self.lexicon.analyze(&q.text))
                .collect(),
        };

        for (kind, rule) in RULES {
            match rule(self, &evidence) {
                Some(moment) if moment.confidence >= self.config.min_confidence => {
                    debug!(moment = %kind, confidence = moment.confidence, "moment classified");
                    return Some(moment);
                }
                Some(moment) => {
                    debug!(moment = %kind, confidence = moment.confidence, "below minimum confidence");
                }
                None => {}
            }
        }
        debug!(line_id = %line.id, "no learning moment");
        None
    }

    fn struggle(&self, ev: &LineEvidence<'_>) -> Option<LearningMoment> {
        let (latest, prior) = ev.profiles.split_last()?;
        let prior_texts: Vec<&str> = ev.line.queries[..prior.len()]
            .iter()
            .map(|q| q.text.as_str())
            .collect();

        let latest_tokens = token_set(latest);
        let mut best: Option<(&str, Vec<&str>)> = None;
        for concept in &latest.concepts {
            // Re-sending the same words is not a new attempt.
            let mut seen = vec![latest_tokens.clone()];
            let mut attempts: Vec<&str> = Vec::new();
            for (profile, text) in prior.iter().zip(&prior_texts) {
                if !profile.concepts.iter().any(|c| same_concept(c, concept)) {
                    continue;
                }
                let tokens = token_set(profile);
                if seen.iter().any(|s| jaccard(s, &tokens) >= REPEAT_SIMILARITY) {
                    continue;
                }
                seen.push(tokens);
                attempts.push(*text);
            }
            if best.as_ref().is_none_or(|(_, b)| attempts.len() > b.len()) {
                best = Some((concept.as_str(), attempts));
            }
        }
        let (concept, attempts) = best?;

        let level = ev.knowledge.level(concept);
        let partial = level > 0.0 && level < self.config.struggle_level_threshold;
        let repeated = attempts.len() >= self.config.min_struggle_attempts;
        let confused_again = latest.confused && partial && !attempts.is_empty();
        if !repeated && !confused_again {
            return None;
        }

        let confidence = (0.5
            + 0.15 * attempts.len() as f64
            + if latest.confused { 0.15 } else { 0.0 })
        .min(0.95);
        let quoted: Vec<String> = attempts
            .iter()
            .map(|t| format!("\"{}\"", excerpt(t, 60)))
            .collect();
        let name = self.lexicon.display(concept);
        let mut reasoning = format!(
            "{} earlier attempt{} at {name}: {}",
            attempts.len(),
            if attempts.len() == 1 { "" } else { "s" },
            quoted.join("; ")
        );
        if latest.confused {
            reasoning.push_str("; the latest query signals confusion");
        }
        reasoning.push_str(&format!("; demonstration level {level:.2}"));

        Some(LearningMoment {
            kind: MomentKind::ConceptStruggle,
            confidence,
            reasoning,
            targets: vec![concept.to_string()],
        })
    }

    fn goal_direction(&self, ev: &LineEvidence<'_>) -> Option<LearningMoment> {
        if ev.profiles.len() < MIN_BREADTH_QUERIES {
            return None;
        }
        let framework_given = ev.line.queries.iter().any(|q| {
            let response = q.response.to_lowercase();
            FRAMEWORK_MARKERS.iter().any(|m| response.contains(m))
        });
        if framework_given {
            return None;
        }

        // sector -> entity -> indices of the queries mentioning it
        let mut by_sector: BTreeMap<&str, BTreeMap<&str, Vec<usize>>> = BTreeMap::new();
        for (idx, profile) in ev.profiles.iter().enumerate() {
            for entity in &profile.entities {
                if let Some(sector) = self.lexicon.sector_of(entity) {
                    by_sector
                        .entry(sector)
                        .or_default()
                        .entry(entity.as_str())
                        .or_default()
                        .push(idx);
                }
            }
        }

        for (sector, entities) in by_sector {
            if entities.len() < self.config.min_breadth_entities {
                continue;
            }
            let queries: BTreeSet<usize> = entities.values().flatten().copied().collect();
            let went_deeper = entities.values().any(|hits| hits.len() > 1);
            if queries.len() < MIN_BREADTH_QUERIES || went_deeper {
                continue;
            }

            // Highest demonstrated level wins; ties go to the most recent mention.
            let direction = entities
                .iter()
                .max_by(|a, b| {
                    ev.knowledge
                        .level(a.0)
                        .total_cmp(&ev.knowledge.level(b.0))
                        .then(a.1.last().cmp(&b.1.last()))
                })
                .map(|(e, _)| *e)?;

            let names: Vec<String> = entities.keys().map(|e| self.lexicon.display(e)).collect();
            let n = entities.len();
            let mut targets = vec![direction.to_string()];
            targets.extend(entities.keys().filter(|e| **e != direction).map(|e| e.to_string()));

            return Some(LearningMoment {
                kind: MomentKind::GoalDirection,
                confidence: (0.65 + 0.1 * n.saturating_sub(MIN_BREADTH_QUERIES) as f64).min(0.9),
                reasoning: format!(
                    "{} queries sampled {} in {sector} without going deeper into any one; \
                     committing to {}",
                    queries.len(),
                    names.join(", "),
                    self.lexicon.display(direction)
                ),
                targets,
            });
        }
        None
    }

    fn no_context(&self, ev: &LineEvidence<'_>) -> Option<LearningMoment> {
        if !ev.own_knowledge().is_empty() || !ev.transferable_knowledge().is_empty() {
            return None;
        }
        let concepts: Vec<String> = ev
            .line_concepts()
            .into_iter()
            .map(|c| self.lexicon.display(c))
            .collect();
        let exposed: Vec<String> = ev
            .line_concepts()
            .into_iter()
            .filter(|c| ev.knowledge.concepts.contains_key(*c))
            .map(|c| self.lexicon.display(c))
            .collect();

        let mut reasoning = format!(
            "no demonstrated knowledge of {} in this or any related line",
            if concepts.is_empty() {
                "this topic".to_string()
            } else {
                concepts.join(", ")
            }
        );
        if !exposed.is_empty() {
            reasoning.push_str(&format!("; only exposed to {}", exposed.join(", ")));
        }

        Some(LearningMoment {
            kind: MomentKind::NewTopicNoContext,
            confidence: if ev.line.queries.len() == 1 { 0.85 } else { 0.75 },
            reasoning,
            targets: Vec::new(),
        })
    }

    fn with_context(&self, ev: &LineEvidence<'_>) -> Option<LearningMoment> {
        if !ev.own_knowledge().is_empty() {
            return None;
        }
        let transferable = ev.transferable_knowledge();
        if transferable.is_empty() {
            return None;
        }
        let cited: Vec<String> = transferable
            .iter()
            .map(|(c, level)| {
                match ev.knowledge.concepts.get(*c).and_then(|r| r.evidence.first()) {
                    Some(first) => {
                        format!("{} (level {level:.2}, {first})", self.lexicon.display(c))
                    }
                    None => self.lexicon.display(c),
                }
            })
            .collect();

        Some(LearningMoment {
            kind: MomentKind::NewTopicWithContext,
            confidence: 0.6 + 0.1 * transferable.len().min(3) as f64,
            reasoning: format!("demonstrated elsewhere: {}", cited.join("; ")),
            targets: transferable.iter().map(|(c, _)| c.to_string()).collect(),
        })
    }
}

fn token_set(profile: &TextProfile) -> BTreeSet<String> {
    profile.tokens.iter().cloned().collect()
}
