//! Follow-up question suggestions returned with every result.

use std::sync::Arc;

use learnline_shared::{KnowledgeState, LearningMoment, MomentKind, QueryLine, Suggestions};

use crate::text::Lexicon;

const PER_LIST: usize = 3;

/// Builds immediate, broader and deeper follow-up suggestions for a line.
pub struct SuggestionBuilder {
    lexicon: Arc<Lexicon>,
}

impl SuggestionBuilder {
    pub fn new(lexicon: Arc<Lexicon>) -> Self {
        Self { lexicon }
    }

    /// `related` are the line's related lines; gaps and next topics come from
    /// the line's learning path.
    pub fn suggest(
        &self,
        line: &QueryLine,
        moment: Option<&LearningMoment>,
        knowledge: &KnowledgeState,
        related: &[QueryLine],
    ) -> Suggestions {
        let focus = if line.current_focus.is_empty() {
            line.refined_topic.as_str()
        } else {
            line.current_focus.as_str()
        };

        let mut immediate = Vec::new();
        if let Some(m) = moment.filter(|m| m.kind == MomentKind::ConceptStruggle) {
            if let Some(target) = m.targets.first() {
                let name = self.lexicon.display(target);
                immediate.push(format!("Can you explain {name} with a simple analogy?"));
                immediate.push(format!("What is a concrete example of {name}?"));
            }
        }
        immediate.push(format!("What are the key facts about {focus}?"));
        immediate.push(format!("How does {focus} relate to {}?", line.inferred_goal));
        immediate.push(format!("What changed recently for {focus}?"));

        let mut broader = Vec::new();
        for other in related {
            if !other.refined_topic.is_empty() {
                broader.push(format!(
                    "How does {} connect to {}?",
                    other.refined_topic, line.refined_topic
                ));
            }
        }
        let line_profile = line
            .queries
            .iter()
            .map(|q| self.lexicon.analyze(&q.text))
            .collect::<Vec<_>>();
        let mentioned: Vec<&String> = line_profile.iter().flat_map(|p| &p.entities).collect();
        for sector in line_profile.iter().flat_map(|p| &p.sectors) {
            for sibling in self.lexicon.sector_entities(sector) {
                if !mentioned.contains(&&sibling.key) {
                    broader.push(format!("How does {} fit into {sector}?", sibling.name));
                }
            }
        }
        if let Some(m) = moment.filter(|m| m.kind == MomentKind::GoalDirection) {
            if let Some(direction) = m.targets.first() {
                let name = self.lexicon.display(direction);
                broader.insert(0, format!("What framework compares {name} with its peers?"));
            }
        }

        let mut deeper: Vec<String> = line
            .learning_path
            .knowledge_gaps
            .iter()
            .map(|gap| format!("What should I know about {gap}?"))
            .collect();
        deeper.extend(
            line.learning_path
                .next_suggested_topics
                .iter()
                .map(|topic| format!("Tell me about {topic}")),
        );
        let mut strongest: Vec<(&String, f64)> = knowledge
            .concepts
            .iter()
            .filter(|(_, r)| r.is_demonstrated() && r.line_ids.contains(&line.id))
            .map(|(c, r)| (c, r.demonstration_level))
            .collect();
        strongest.sort_by(|a, b| b.1.total_cmp(&a.1));
        deeper.extend(strongest.into_iter().map(|(c, _)| {
            format!("What are the advanced details of {}?", self.lexicon.display(c))
        }));

        Suggestions {
            immediate: dedupe(immediate),
            broader: dedupe(broader),
            deeper: dedupe(deeper),
        }
    }
}

/// Case-insensitive dedupe keeping first occurrences, capped per list.
fn dedupe(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if !out.iter().any(|o| o.eq_ignore_ascii_case(&item)) {
            out.push(item);
        }
        if out.len() == PER_LIST {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use learnline_shared::{LineConfig, Query};

    use super::*;
    use crate::lines::QueryLineManager;

    fn open(text: &str) -> QueryLine {
        let lexicon = Arc::new(Lexicon::builtin());
        QueryLineManager::new(LineConfig::default(), lexicon).open(
            "u1",
            Query {
                text: text.into(),
                response: String::new(),
                citations: vec![],
                asked_at: Utc::now(),
            },
        )
    }

    #[test]
    fn lists_are_capped_and_distinct() {
        let builder = SuggestionBuilder::new(Arc::new(Lexicon::builtin()));
        let mut line = open("what's NVIDIA's market share?");
        line.learning_path.knowledge_gaps = vec!["Microsoft".into(), "microsoft".into()];
        line.learning_path.next_suggested_topics = vec!["how chip compares with competitors".into()];

        let s = builder.suggest(&line, None, &KnowledgeState::empty("u1"), &[]);
        for list in [&s.immediate, &s.broader, &s.deeper] {
            assert!(list.len() <= 3);
        }
        assert_eq!(s.immediate[0], "What are the key facts about NVIDIA?");
        assert_eq!(s.deeper.len(), 2);
        assert!(s.broader.iter().any(|b| b.contains("AMD")));
        assert!(s.broader.iter().all(|b| !b.starts_with("How does NVIDIA")));
    }

    #[test]
    fn struggle_leads_with_simpler_explanations() {
        let builder = SuggestionBuilder::new(Arc::new(Lexicon::builtin()));
        let line = open("still confused about CUDA parallelism");
        let moment = LearningMoment {
            kind: MomentKind::ConceptStruggle,
            confidence: 0.9,
            reasoning: "repeated".into(),
            targets: vec!["cuda parallelism".into()],
        };
        let s = builder.suggest(&line, Some(&moment), &KnowledgeState::empty("u1"), &[]);
        assert_eq!(
            s.immediate[0],
            "Can you explain cuda parallelism with a simple analogy?"
        );
    }

    #[test]
    fn related_lines_broaden() {
        let builder = SuggestionBuilder::new(Arc::new(Lexicon::builtin()));
        let line = open("what is TAM?");
        let other = open("how does Tesla make batteries?");
        let s = builder.suggest(&line, None, &KnowledgeState::empty("u1"), &[other.clone()]);
        assert_eq!(
            s.broader[0],
            format!("How does {} connect to tam?", other.refined_topic)
        );
    }
}
