//! Search strategy generation, shaped by the learning moment and by the
//! filter's rejections on retry.

use std::collections::HashSet;
use std::sync::Arc;

use learnline_shared::{
    Angle, Depth, GoalFrame, KnowledgeState, LearningMoment, MomentKind, QueryLine, Rejection,
    RejectionReason, SearchQuery, SearchStrategy,
};
use tracing::debug;

use crate::text::{Lexicon, excerpt};

/// What the previous attempt produced and why all of it was rejected.
#[derive(Debug, Clone)]
pub struct FailureFeedback {
    pub previous: SearchStrategy,
    pub rejections: Vec<Rejection>,
}

impl FailureFeedback {
    /// The most frequent rejection reason; `NoContent` when nothing was found at all.
    pub fn dominant_reason(&self) -> RejectionReason {
        let mut counts: Vec<(RejectionReason, usize)> = Vec::new();
        for rejection in &self.rejections {
            match counts.iter_mut().find(|(r, _)| *r == rejection.reason) {
                Some(entry) => entry.1 += 1,
                None => counts.push((rejection.reason, 1)),
            }
        }
        let mut dominant: Option<(RejectionReason, usize)> = None;
        for (reason, count) in counts {
            if dominant.is_none_or(|(_, best)| count > best) {
                dominant = Some((reason, count));
            }
        }
        dominant.map_or(RejectionReason::NoContent, |(reason, _)| reason)
    }

    fn count(&self, reason: RejectionReason) -> usize {
        self.rejections.iter().filter(|r| r.reason == reason).count()
    }
}

/// Turns a line, its moment and the user's knowledge into search queries.
pub struct StrategyGenerator {
    max_queries: usize,
    lexicon: Arc<Lexicon>,
}

/// Subjects a strategy is phrased around.
struct Subjects {
    /// What the latest query is about.
    focus: String,
    /// What the line as a whole is about.
    primary: String,
}

impl StrategyGenerator {
    pub fn new(max_queries: usize, lexicon: Arc<Lexicon>) -> Self {
        Self {
            max_queries: max_queries.max(1),
            lexicon,
        }
    }

    fn subjects(&self, line: &QueryLine) -> Subjects {
        let display_all = |concepts: &[String]| {
            concepts
                .iter()
                .map(|c| self.lexicon.display(c))
                .collect::<Vec<_>>()
                .join(" ")
        };
        let latest = line.latest_query().map(|q| self.lexicon.analyze(&q.text));
        let first = line.queries.first().map(|q| self.lexicon.analyze(&q.text));

        let fallback = if line.refined_topic.is_empty() {
            line.latest_query()
                .map(|q| excerpt(&q.text, 60))
                .unwrap_or_default()
        } else {
            line.refined_topic.clone()
        };
        let focus = latest
            .as_ref()
            .filter(|p| !p.concepts.is_empty())
            .map(|p| display_all(&p.concepts))
            .unwrap_or_else(|| fallback.clone());
        let primary = first
            .as_ref()
            .and_then(|p| p.entities.first().or_else(|| p.concepts.first()))
            .map(|c| self.lexicon.display(c))
            .unwrap_or(fallback);
        Subjects { focus, primary }
    }

    /// Generate the strategy for the next attempt.
    ///
    /// Without feedback this is attempt 1. With feedback, every query is
    /// reshaped by the dominant rejection reason and no query text repeats one
    /// from the previous attempt.
    pub fn generate(
        &self,
        line: &QueryLine,
        moment: Option<&LearningMoment>,
        knowledge: &KnowledgeState,
        feedback: Option<&FailureFeedback>,
        follow_ups: &[String],
    ) -> SearchStrategy {
        let subjects = self.subjects(line);
        let (mut queries, direction_rationale) = match moment {
            Some(m) => match m.kind {
                MomentKind::NewTopicNoContext => (self.no_context(&subjects), None),
                MomentKind::NewTopicWithContext => {
                    (self.with_context(&subjects, m, knowledge), None)
                }
                MomentKind::ConceptStruggle => (self.struggle(&subjects, m), None),
                MomentKind::GoalDirection => self.direction(line, m, knowledge),
            },
            None => (self.neutral(&subjects), None),
        };

        for follow_up in follow_ups {
            if queries.iter().any(|q| q.query_text.eq_ignore_ascii_case(follow_up)) {
                continue;
            }
            queries.push(SearchQuery {
                query_text: follow_up.clone(),
                reasoning: format!(
                    "asked as a follow-up after reading earlier recommendations: \"{}\"",
                    excerpt(follow_up, 60)
                ),
                depth: Depth::Intermediate,
                angle: Angle::FollowUp,
            });
        }
        queries.truncate(self.max_queries);

        let attempt = match feedback {
            Some(feedback) => {
                self.adjust(&mut queries, feedback, line, &subjects);
                feedback.previous.attempt + 1
            }
            None => 1,
        };

        debug!(
            attempt,
            queries = queries.len(),
            moment = ?moment.map(|m| m.kind),
            "strategy generated"
        );
        SearchStrategy {
            attempt,
            queries,
            direction_rationale,
        }
    }

    fn no_context(&self, s: &Subjects) -> Vec<SearchQuery> {
        let focus = &s.focus;
        vec![
            query(
                format!("{focus} explained for beginners"),
                format!("nothing about {focus} is demonstrated yet, so start from fundamentals"),
                Depth::Introductory,
                Angle::Fundamentals,
            ),
            query(
                format!("how {focus} works core mechanics"),
                format!("build outward from the core mechanics of {focus}"),
                Depth::Intermediate,
                Angle::Fundamentals,
            ),
            query(
                format!("{focus} emerging trends and outlook"),
                format!("once the basics are in place, point toward where {focus} is heading"),
                Depth::Intermediate,
                Angle::Forward,
            ),
        ]
    }

    fn with_context(
        &self,
        s: &Subjects,
        moment: &LearningMoment,
        knowledge: &KnowledgeState,
    ) -> Vec<SearchQuery> {
        let focus = &s.focus;
        let mut queries: Vec<SearchQuery> = moment
            .targets
            .iter()
            .take(2)
            .map(|concept| {
                let name = self.lexicon.display(concept);
                query(
                    format!("how {name} applies to {focus}"),
                    format!(
                        "transfers demonstrated understanding of {name} (level {:.2}) into {focus}",
                        knowledge.level(concept)
                    ),
                    Depth::Intermediate,
                    Angle::Transfer,
                )
            })
            .collect();
        if let Some(first) = moment.targets.first() {
            let name = self.lexicon.display(first);
            queries.push(query(
                format!("{focus} compared with {name}"),
                format!("contrast {focus} with {name}, which the user already understands"),
                Depth::Intermediate,
                Angle::Comparative,
            ));
        }
        queries
    }

    fn struggle(&self, s: &Subjects, moment: &LearningMoment) -> Vec<SearchQuery> {
        let concept = moment
            .targets
            .first()
            .map(|c| self.lexicon.display(c))
            .unwrap_or_else(|| s.focus.clone());
        vec![
            query(
                format!("{concept} explained simply with an analogy"),
                format!("repeated attempts at {concept}: try an intuitive analogy instead of more detail"),
                Depth::Introductory,
                Angle::Intuitive,
            ),
            query(
                format!("{concept} worked example step by step"),
                format!("a concrete worked example of {concept} to resolve the confusion"),
                Depth::Introductory,
                Angle::Example,
            ),
            query(
                format!("{concept} compared with familiar alternatives"),
                format!("contrast {concept} with something familiar to anchor it"),
                Depth::Introductory,
                Angle::Comparative,
            ),
        ]
    }

    fn direction(
        &self,
        line: &QueryLine,
        moment: &LearningMoment,
        knowledge: &KnowledgeState,
    ) -> (Vec<SearchQuery>, Option<String>) {
        let Some(direction) = moment.targets.first() else {
            return (self.neutral(&self.subjects(line)), None);
        };
        let name = self.lexicon.display(direction);
        let siblings: Vec<String> = moment.targets[1..]
            .iter()
            .map(|c| self.lexicon.display(c))
            .collect();
        let why = if knowledge.level(direction) > 0.0 {
            format!(
                "it is where understanding is strongest (level {:.2})",
                knowledge.level(direction)
            )
        } else {
            "it is the most recent subject of the line".to_string()
        };
        let rationale = format!(
            "go deep on {name} instead of sampling {}: {why}",
            siblings.join(", ")
        );
        let angle = match line.goal {
            GoalFrame::General | GoalFrame::Mechanics => "business model".to_string(),
            frame => frame.describe().to_string(),
        };

        let queries = vec![
            query(
                format!("{name} {angle} in depth"),
                format!("commit to {name} and study its {angle} thoroughly"),
                Depth::Technical,
                Angle::Direction,
            ),
            query(
                format!("{name} competitive moat analysis"),
                format!("what keeps {name} ahead, rather than another company overview"),
                Depth::Technical,
                Angle::Direction,
            ),
            query(
                format!("{name} key metrics and long-term drivers"),
                format!("the numbers that explain {name}'s trajectory"),
                Depth::Technical,
                Angle::Direction,
            ),
        ];
        (queries, Some(rationale))
    }

    fn neutral(&self, s: &Subjects) -> Vec<SearchQuery> {
        let focus = &s.focus;
        vec![
            query(
                format!("{focus} overview"),
                format!("general background on {focus}"),
                Depth::Intermediate,
                Angle::Overview,
            ),
            query(
                format!("{focus} latest developments"),
                format!("recent developments around {focus}"),
                Depth::Intermediate,
                Angle::Forward,
            ),
        ]
    }

    /// Reshape `queries` according to the previous attempt's rejections.
    fn adjust(
        &self,
        queries: &mut [SearchQuery],
        feedback: &FailureFeedback,
        line: &QueryLine,
        s: &Subjects,
    ) {
        let reason = feedback.dominant_reason();
        let goal = line.goal.describe();
        let primary = &s.primary;
        let (modifiers, adjustment): (Vec<String>, &str) = match reason {
            RejectionReason::TooSuperficial => (
                strings(&["technical deep dive", "detailed analysis with data", "expert breakdown"]),
                "going deeper",
            ),
            RejectionReason::TooAdvanced => (
                strings(&["for beginners", "in plain language", "simple introduction"]),
                "simplifying",
            ),
            RejectionReason::OffTopic => (
                vec![
                    format!("for {primary}"),
                    format!("{primary} {goal}"),
                    format!("specifically about {primary}"),
                ],
                "anchoring on the line's subject",
            ),
            RejectionReason::Redundant | RejectionReason::AlreadySeen => (
                strings(&["case studies", "contrarian view", "recent research"]),
                "shifting the angle",
            ),
            RejectionReason::AddsBreadth => (
                strings(&["single company deep dive", "specific metrics", "detailed case"]),
                "narrowing the scope",
            ),
            RejectionReason::DoesNotResolveConfusion => (
                strings(&["worked example step by step", "visual explanation", "common misconceptions"]),
                "switching to worked examples",
            ),
            RejectionReason::NoContent => (
                strings(&["guide", "explained", "overview"]),
                "broadening",
            ),
        };

        let attempt = feedback.previous.attempt as usize;
        let mut taken: HashSet<String> = feedback
            .previous
            .queries
            .iter()
            .map(|q| q.query_text.to_lowercase())
            .collect();
        let note = format!(
            "previous attempt {} ({} of {} rejections), so {adjustment}",
            reason.describe(),
            feedback.count(reason),
            feedback.rejections.len()
        );

        for (i, q) in queries.iter_mut().enumerate() {
            let base = match reason {
                RejectionReason::NoContent => shorten(&q.query_text),
                _ => q.query_text.clone(),
            };
            let text = (0..modifiers.len())
                .map(|k| {
                    let slot = (attempt.saturating_sub(1) + i + k) % modifiers.len();
                    format!("{base} {}", modifiers[slot])
                })
                .find(|candidate| !taken.contains(&candidate.to_lowercase()))
                .unwrap_or_else(|| format!("{base} ({adjustment}, attempt {})", attempt + 1));
            taken.insert(text.to_lowercase());

            q.depth = match reason {
                RejectionReason::TooSuperficial => q.depth.deeper(),
                RejectionReason::TooAdvanced | RejectionReason::DoesNotResolveConfusion => {
                    q.depth.shallower()
                }
                _ => q.depth,
            };
            if reason == RejectionReason::DoesNotResolveConfusion {
                q.angle = Angle::Example;
            }
            q.query_text = text;
            q.reasoning = format!("{}; {note}", q.reasoning);
        }
    }
}

fn query(text: String, reasoning: String, depth: Depth, angle: Angle) -> SearchQuery {
    SearchQuery {
        query_text: text,
        reasoning,
        depth,
        angle,
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// The first three words of a query, for broader retries.
fn shorten(text: &str) -> String {
    text.split_whitespace().take(3).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use learnline_shared::{ConceptChange, KnowledgeDelta, LineConfig, Query};

    use super::*;
    use crate::lines::QueryLineManager;

    fn lexicon() -> Arc<Lexicon> {
        Arc::new(Lexicon::builtin())
    }

    fn line_for(texts: &[&str]) -> QueryLine {
        let lines = QueryLineManager::new(LineConfig::default(), lexicon());
        let mut queries = texts.iter().map(|t| Query {
            text: t.to_string(),
            response: String::new(),
            citations: vec![],
            asked_at: Utc::now(),
        });
        let mut line = lines.open("u1", queries.next().unwrap());
        for q in queries {
            lines.record(&mut line, q);
        }
        line
    }

    fn moment(kind: MomentKind, targets: &[&str]) -> LearningMoment {
        LearningMoment {
            kind,
            confidence: 0.8,
            reasoning: "test".into(),
            targets: targets.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn rejections(reason: RejectionReason, n: usize) -> Vec<Rejection> {
        (0..n)
            .map(|i| Rejection {
                content_id: format!("c{i}"),
                url: format!("https://example.com/{i}"),
                reason,
                detail: String::new(),
            })
            .collect()
    }

    #[test]
    fn no_context_starts_from_fundamentals() {
        let generator = StrategyGenerator::new(5, lexicon());
        let line = line_for(&["what is CUDA parallelism?"]);
        let strategy = generator.generate(
            &line,
            Some(&moment(MomentKind::NewTopicNoContext, &[])),
            &KnowledgeState::empty("u1"),
            None,
            &[],
        );

        assert_eq!(strategy.attempt, 1);
        assert_eq!(strategy.queries[0].angle, Angle::Fundamentals);
        assert_eq!(strategy.queries[0].depth, Depth::Introductory);
        assert_eq!(
            strategy.queries[0].query_text,
            "cuda parallelism explained for beginners"
        );
        assert!(strategy.direction_rationale.is_none());
        assert!(strategy.queries.iter().all(|q| !q.reasoning.is_empty()));
    }

    #[test]
    fn with_context_names_the_transferred_concept() {
        let generator = StrategyGenerator::new(5, lexicon());
        let line = line_for(&["which chips power Tesla's self-driving?"]);
        let mut knowledge = KnowledgeState::empty("u1");
        knowledge.merge(&KnowledgeDelta {
            changes: vec![ConceptChange {
                concept: "nvidia".into(),
                line_id: None,
                demonstration_level: 0.5,
                evidence: vec!["connected".into()],
                exposures: vec![],
                confusions: vec![],
                observed_at: Utc::now(),
            }],
            seen_content: vec![],
        });

        let strategy = generator.generate(
            &line,
            Some(&moment(MomentKind::NewTopicWithContext, &["nvidia"])),
            &knowledge,
            None,
            &[],
        );
        assert_eq!(strategy.queries[0].angle, Angle::Transfer);
        assert!(strategy.queries[0].query_text.starts_with("how NVIDIA applies to"));
        assert!(strategy.queries[0].reasoning.contains("level 0.50"));
    }

    #[test]
    fn struggle_prefers_intuition_over_novelty() {
        let generator = StrategyGenerator::new(5, lexicon());
        let line = line_for(&["still confused about CUDA parallelism"]);
        let strategy = generator.generate(
            &line,
            Some(&moment(MomentKind::ConceptStruggle, &["cuda parallelism"])),
            &KnowledgeState::empty("u1"),
            None,
            &[],
        );
        assert!(strategy.queries.iter().all(|q| q.depth == Depth::Introductory));
        assert_eq!(strategy.queries[0].angle, Angle::Intuitive);
    }

    #[test]
    fn direction_commits_with_rationale() {
        let generator = StrategyGenerator::new(5, lexicon());
        let line = line_for(&["what's NVIDIA's share?", "and AMD's share?", "and Intel's share?"]);
        let strategy = generator.generate(
            &line,
            Some(&moment(MomentKind::GoalDirection, &["intel", "amd", "nvidia"])),
            &KnowledgeState::empty("u1"),
            None,
            &[],
        );
        let rationale = strategy.direction_rationale.unwrap();
        assert!(rationale.starts_with("go deep on Intel instead of sampling AMD, NVIDIA"));
        assert!(strategy.queries.iter().all(|q| q.query_text.starts_with("Intel")));
        assert_eq!(strategy.queries[0].query_text, "Intel market position in depth");
    }

    #[test]
    fn direction_without_targets_has_no_rationale() {
        let generator = StrategyGenerator::new(5, lexicon());
        let line = line_for(&["what's NVIDIA's share?"]);
        let strategy = generator.generate(
            &line,
            Some(&moment(MomentKind::GoalDirection, &[])),
            &KnowledgeState::empty("u1"),
            None,
            &[],
        );
        assert!(strategy.direction_rationale.is_none());
        assert_eq!(strategy.queries[0].angle, Angle::Overview);
    }

    #[test]
    fn follow_ups_fill_remaining_slots() {
        let generator = StrategyGenerator::new(4, lexicon());
        let line = line_for(&["what is TAM?"]);
        let strategy = generator.generate(
            &line,
            None,
            &KnowledgeState::empty("u1"),
            None,
            &["how is TAM different from SAM?".into(), "TAM for SaaS".into(), "extra".into()],
        );
        assert_eq!(strategy.queries.len(), 4);
        assert_eq!(strategy.queries[2].angle, Angle::FollowUp);
        assert_eq!(strategy.queries[3].query_text, "TAM for SaaS");
    }

    #[test]
    fn superficial_results_push_deeper() {
        let generator = StrategyGenerator::new(5, lexicon());
        let line = line_for(&["what is CUDA parallelism?"]);
        let m = moment(MomentKind::NewTopicNoContext, &[]);
        let knowledge = KnowledgeState::empty("u1");
        let first = generator.generate(&line, Some(&m), &knowledge, None, &[]);

        let feedback = FailureFeedback {
            previous: first.clone(),
            rejections: rejections(RejectionReason::TooSuperficial, 3),
        };
        let second = generator.generate(&line, Some(&m), &knowledge, Some(&feedback), &[]);

        assert_eq!(second.attempt, 2);
        for (before, after) in first.queries.iter().zip(&second.queries) {
            assert!(after.depth > before.depth);
            assert_ne!(after.query_text, before.query_text);
            assert!(after.reasoning.contains("found but too superficial"));
        }
        assert_eq!(
            second.queries[0].query_text,
            "cuda parallelism explained for beginners technical deep dive"
        );
    }

    #[test]
    fn every_reason_changes_the_query_set() {
        let generator = StrategyGenerator::new(5, lexicon());
        let line = line_for(&["what's NVIDIA's market share?"]);
        let knowledge = KnowledgeState::empty("u1");
        let m = moment(MomentKind::NewTopicNoContext, &[]);
        let first = generator.generate(&line, Some(&m), &knowledge, None, &[]);

        for reason in [
            RejectionReason::TooSuperficial,
            RejectionReason::TooAdvanced,
            RejectionReason::OffTopic,
            RejectionReason::Redundant,
            RejectionReason::AddsBreadth,
            RejectionReason::DoesNotResolveConfusion,
            RejectionReason::AlreadySeen,
            RejectionReason::NoContent,
        ] {
            let mut previous = first.clone();
            // Three rounds: no text may repeat the round before it.
            for _ in 0..3 {
                let feedback = FailureFeedback {
                    previous: previous.clone(),
                    rejections: rejections(reason, 2),
                };
                let next = generator.generate(&line, Some(&m), &knowledge, Some(&feedback), &[]);
                let old: HashSet<&str> =
                    previous.queries.iter().map(|q| q.query_text.as_str()).collect();
                assert!(
                    next.queries.iter().all(|q| !old.contains(q.query_text.as_str())),
                    "{reason:?} repeated a query"
                );
                previous = next;
            }
        }
    }

    #[test]
    fn empty_rejections_mean_no_content() {
        let feedback = FailureFeedback {
            previous: SearchStrategy {
                attempt: 1,
                queries: vec![],
                direction_rationale: None,
            },
            rejections: vec![],
        };
        assert_eq!(feedback.dominant_reason(), RejectionReason::NoContent);

        let mut mixed = rejections(RejectionReason::OffTopic, 1);
        mixed.extend(rejections(RejectionReason::TooAdvanced, 2));
        let feedback = FailureFeedback {
            rejections: mixed,
            ..feedback
        };
        assert_eq!(feedback.dominant_reason(), RejectionReason::TooAdvanced);
    }
}
