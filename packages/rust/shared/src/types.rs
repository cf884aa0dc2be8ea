//! Core domain types for the learning-moment pipeline.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// LineId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for query line identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LineId(pub Uuid);

impl LineId {
    /// Generate a new time-sortable line identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for LineId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for LineId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Stable content identifier: the first 16 hex chars of SHA-256 over the URL.
pub fn content_id(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

// ---------------------------------------------------------------------------
// Query lines
// ---------------------------------------------------------------------------

/// One submitted query and the answer it received. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    pub response: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<String>,
    pub asked_at: DateTime<Utc>,
}

/// The kind of understanding a query is after, independent of its subject.
///
/// Two queries about the same company can pursue different frames
/// (its share of a market vs. the size of that market).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalFrame {
    MarketPosition,
    MarketSize,
    DemandDrivers,
    Competition,
    Financials,
    Outlook,
    Mechanics,
    General,
}

impl GoalFrame {
    /// Short human phrase used in goal descriptions.
    pub fn describe(self) -> &'static str {
        match self {
            Self::MarketPosition => "market position",
            Self::MarketSize => "market size",
            Self::DemandDrivers => "demand drivers",
            Self::Competition => "competitive landscape",
            Self::Financials => "financial performance",
            Self::Outlook => "future outlook",
            Self::Mechanics => "how it works",
            Self::General => "general understanding",
        }
    }
}

/// Summary of a line's trajectory, exposed with every result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineAnalysis {
    pub inferred_goal: String,
    pub current_focus: String,
    pub learning_progression: String,
}

/// Gaps and next steps computed from the knowledge state for one line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearningPath {
    pub knowledge_gaps: Vec<String>,
    pub next_suggested_topics: Vec<String>,
}

/// An ordered thread of queries sharing one inferred goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLine {
    pub id: LineId,
    pub user_id: String,
    /// Frame the line was opened with; later queries may extend it.
    pub goal: GoalFrame,
    pub refined_topic: String,
    pub inferred_goal: String,
    pub current_focus: String,
    pub learning_progression: String,
    #[serde(default)]
    pub related_line_ids: BTreeSet<LineId>,
    #[serde(default)]
    pub queries: Vec<Query>,
    #[serde(default)]
    pub learning_path: LearningPath,
    /// Inactive lines are never continued, only referenced.
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// Stored revision; `0` until the line is first saved.
    #[serde(default)]
    pub version: u64,
}

impl QueryLine {
    /// Open an empty line for `user_id`.
    pub fn open(user_id: &str, goal: GoalFrame, now: DateTime<Utc>) -> Self {
        Self {
            id: LineId::new(),
            user_id: user_id.to_string(),
            goal,
            refined_topic: String::new(),
            inferred_goal: String::new(),
            current_focus: String::new(),
            learning_progression: String::new(),
            related_line_ids: BTreeSet::new(),
            queries: Vec::new(),
            learning_path: LearningPath::default(),
            active: true,
            created_at: now,
            last_active_at: now,
            version: 0,
        }
    }

    pub fn analysis(&self) -> LineAnalysis {
        LineAnalysis {
            inferred_goal: self.inferred_goal.clone(),
            current_focus: self.current_focus.clone(),
            learning_progression: self.learning_progression.clone(),
        }
    }

    pub fn latest_query(&self) -> Option<&Query> {
        self.queries.last()
    }
}

// ---------------------------------------------------------------------------
// Knowledge state
// ---------------------------------------------------------------------------

/// What the user is known to understand about one concept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptRecord {
    /// Only raised by evidence from the user's own query text.
    pub demonstration_level: f64,
    /// Demonstration evidence snippets, append-only.
    #[serde(default)]
    pub evidence: Vec<String>,
    /// Where the concept was seen without being demonstrated.
    #[serde(default)]
    pub exposures: Vec<String>,
    /// Query texts that signalled confusion about the concept.
    #[serde(default)]
    pub confusions: Vec<String>,
    #[serde(default)]
    pub line_ids: BTreeSet<LineId>,
    /// Highest level demonstrated from each line's own queries.
    #[serde(default)]
    pub line_levels: BTreeMap<LineId, f64>,
    pub first_seen_at: DateTime<Utc>,
}

impl ConceptRecord {
    pub fn new(first_seen_at: DateTime<Utc>) -> Self {
        Self {
            demonstration_level: 0.0,
            evidence: Vec::new(),
            exposures: Vec::new(),
            confusions: Vec::new(),
            line_ids: BTreeSet::new(),
            line_levels: BTreeMap::new(),
            first_seen_at,
        }
    }

    pub fn is_demonstrated(&self) -> bool {
        self.demonstration_level > 0.0
    }

    /// Level demonstrated on `line_id` itself.
    pub fn level_on(&self, line_id: LineId) -> f64 {
        self.line_levels.get(&line_id).copied().unwrap_or(0.0)
    }

    /// Lines other than `line_id` where the concept was demonstrated.
    pub fn demonstrated_elsewhere(&self, line_id: LineId) -> impl Iterator<Item = (LineId, f64)> {
        self.line_levels
            .iter()
            .filter(move |(id, level)| **id != line_id && **level > 0.0)
            .map(|(id, level)| (*id, *level))
    }
}

/// Per-user knowledge model, versioned and updated only through merges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeState {
    pub user_id: String,
    pub version: u64,
    #[serde(default)]
    pub concepts: BTreeMap<String, ConceptRecord>,
    /// Content ids the user already interacted with.
    #[serde(default)]
    pub seen_content: BTreeSet<String>,
}

/// Proposed change to one concept, produced by the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptChange {
    pub concept: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_id: Option<LineId>,
    /// Proposed level; merged with `max`, so it can never lower the stored one.
    pub demonstration_level: f64,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub exposures: Vec<String>,
    #[serde(default)]
    pub confusions: Vec<String>,
    pub observed_at: DateTime<Utc>,
}

impl ConceptChange {
    pub fn raised_level(&self) -> bool {
        !self.evidence.is_empty()
    }
}

/// The result of one tracker update, applied with [`KnowledgeState::merge`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeDelta {
    pub changes: Vec<ConceptChange>,
    #[serde(default)]
    pub seen_content: Vec<String>,
}

impl KnowledgeDelta {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.seen_content.is_empty()
    }

    /// Concepts whose level this delta raises.
    pub fn demonstrated(&self) -> impl Iterator<Item = &ConceptChange> {
        self.changes.iter().filter(|c| c.raised_level())
    }
}

impl KnowledgeState {
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            version: 0,
            concepts: BTreeMap::new(),
            seen_content: BTreeSet::new(),
        }
    }

    /// Merge a delta: max on level, set union on evidence, earliest first-seen.
    ///
    /// Merging is order-insensitive for levels and evidence membership, and
    /// merging the same delta twice leaves the state unchanged. The version
    /// only moves when the merge changed something. Returns whether it did.
    pub fn merge(&mut self, delta: &KnowledgeDelta) -> bool {
        let mut changed = false;
        for change in &delta.changes {
            let record = self.concepts.entry(change.concept.clone()).or_insert_with(|| {
                changed = true;
                ConceptRecord::new(change.observed_at)
            });
            let level = change.demonstration_level.clamp(0.0, 1.0);
            if level > record.demonstration_level {
                record.demonstration_level = level;
                changed = true;
            }
            changed |= union_into(&mut record.evidence, &change.evidence);
            changed |= union_into(&mut record.exposures, &change.exposures);
            changed |= union_into(&mut record.confusions, &change.confusions);
            if let Some(line_id) = change.line_id {
                changed |= record.line_ids.insert(line_id);
                if change.raised_level() && level > record.level_on(line_id) {
                    record.line_levels.insert(line_id, level);
                    changed = true;
                }
            }
            if change.observed_at < record.first_seen_at {
                record.first_seen_at = change.observed_at;
                changed = true;
            }
        }
        for content_id in &delta.seen_content {
            changed |= self.seen_content.insert(content_id.clone());
        }
        if changed {
            self.version += 1;
        }
        changed
    }

    /// Explicitly forget how well a concept is understood.
    ///
    /// The only operation that lowers a demonstration level. Evidence is kept.
    pub fn reset_concept(&mut self, concept: &str) -> bool {
        match self.concepts.get_mut(concept) {
            Some(record) => {
                record.demonstration_level = 0.0;
                record.line_levels.clear();
                record
                    .evidence
                    .push(format!("reset at {}", Utc::now().to_rfc3339()));
                self.version += 1;
                true
            }
            None => false,
        }
    }

    pub fn level(&self, concept: &str) -> f64 {
        self.concepts
            .get(concept)
            .map(|r| r.demonstration_level)
            .unwrap_or(0.0)
    }
}

fn union_into(target: &mut Vec<String>, items: &[String]) -> bool {
    let before = target.len();
    for item in items {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
    target.len() != before
}

/// Demonstrated and exposed concepts relevant to one topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeView {
    pub topic: String,
    pub demonstrated: BTreeMap<String, ConceptRecord>,
    pub exposed: BTreeMap<String, ConceptRecord>,
}

// ---------------------------------------------------------------------------
// Learning moments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MomentKind {
    NewTopicNoContext,
    NewTopicWithContext,
    ConceptStruggle,
    GoalDirection,
}

impl std::fmt::Display for MomentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NewTopicNoContext => "new_topic_no_context",
            Self::NewTopicWithContext => "new_topic_with_context",
            Self::ConceptStruggle => "concept_struggle",
            Self::GoalDirection => "goal_direction",
        };
        f.write_str(s)
    }
}

/// A classified learning situation for one line evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningMoment {
    pub kind: MomentKind,
    pub confidence: f64,
    pub reasoning: String,
    /// The concept struggled with, the chosen direction, or the transferred concepts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
}

// ---------------------------------------------------------------------------
// Search strategies
// ---------------------------------------------------------------------------

/// Technical depth a search query aims for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Depth {
    Introductory,
    Intermediate,
    Technical,
    Expert,
}

impl Depth {
    pub fn deeper(self) -> Self {
        match self {
            Self::Introductory => Self::Intermediate,
            Self::Intermediate => Self::Technical,
            Self::Technical | Self::Expert => Self::Expert,
        }
    }

    pub fn shallower(self) -> Self {
        match self {
            Self::Expert => Self::Technical,
            Self::Technical => Self::Intermediate,
            Self::Intermediate | Self::Introductory => Self::Introductory,
        }
    }
}

/// The angle a search query approaches its subject from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Angle {
    Fundamentals,
    Forward,
    Transfer,
    Intuitive,
    Example,
    Comparative,
    Direction,
    Overview,
    FollowUp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub query_text: String,
    pub reasoning: String,
    pub depth: Depth,
    pub angle: Angle,
}

/// A ranked set of search queries for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchStrategy {
    pub attempt: u32,
    pub queries: Vec<SearchQuery>,
    /// Set only for the goal-direction moment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction_rationale: Option<String>,
}

// ---------------------------------------------------------------------------
// Content
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentSection {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Currency,
    Percentage,
}

/// A quantitative fact pulled from page text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub kind: MetricKind,
    pub value: String,
    /// The sentence the value appeared in.
    pub context: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub metrics: Vec<Metric>,
    pub word_count: usize,
}

/// Structured output of the content extraction service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub sections: Vec<ContentSection>,
    pub metadata: ContentMetadata,
}

impl ExtractedDocument {
    pub fn is_empty(&self) -> bool {
        self.sections.iter().all(|s| s.body.trim().is_empty())
    }

    /// All section titles and bodies joined, for scoring.
    pub fn full_text(&self) -> String {
        let mut text = String::new();
        if let Some(title) = &self.metadata.title {
            text.push_str(title);
            text.push('\n');
        }
        for section in &self.sections {
            text.push_str(&section.title);
            text.push('\n');
            text.push_str(&section.body);
            text.push('\n');
        }
        text
    }
}

/// A discovered page that passed relevance filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub content_id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub explanation: String,
    pub relevant_sections: Vec<String>,
    pub value_score: f64,
}

// ---------------------------------------------------------------------------
// Filtering feedback
// ---------------------------------------------------------------------------

/// Why a candidate was turned down. Consumed by the strategy generator on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    TooSuperficial,
    TooAdvanced,
    OffTopic,
    Redundant,
    AddsBreadth,
    DoesNotResolveConfusion,
    AlreadySeen,
    NoContent,
}

impl RejectionReason {
    pub fn describe(self) -> &'static str {
        match self {
            Self::TooSuperficial => "found but too superficial",
            Self::TooAdvanced => "found but too advanced",
            Self::OffTopic => "found but off topic",
            Self::Redundant => "found but repeats what is already understood",
            Self::AddsBreadth => "found but adds breadth instead of depth",
            Self::DoesNotResolveConfusion => "found but does not address the confusion",
            Self::AlreadySeen => "already seen by the user",
            Self::NoContent => "no usable content",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub content_id: String,
    pub url: String,
    pub reason: RejectionReason,
    pub detail: String,
}

/// What went wrong in one strategy attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptFailure {
    pub attempt: u32,
    pub queries: Vec<String>,
    pub rejections: Vec<Rejection>,
    /// Discovery or extraction calls dropped during the attempt.
    pub dropped_calls: usize,
}

// ---------------------------------------------------------------------------
// Results and progress
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Suggestions {
    pub immediate: Vec<String>,
    pub broader: Vec<String>,
    pub deeper: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationResult {
    pub moment: Option<LearningMoment>,
    pub line_id: LineId,
    pub line_analysis: LineAnalysis,
    pub recommendations: Vec<Recommendation>,
    pub suggestions: Suggestions,
    pub attempts: u32,
}

/// Terminal "nothing found" outcome, with the reasons collected on the way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExhaustedReport {
    pub moment: Option<LearningMoment>,
    pub line_id: LineId,
    pub line_analysis: LineAnalysis,
    pub failures: Vec<AttemptFailure>,
    pub suggestions: Suggestions,
}

impl ExhaustedReport {
    /// Distinct rejection reasons across all attempts, in first-seen order.
    pub fn reasons(&self) -> Vec<RejectionReason> {
        let mut reasons = Vec::new();
        for failure in &self.failures {
            for rejection in &failure.rejections {
                if !reasons.contains(&rejection.reason) {
                    reasons.push(rejection.reason);
                }
            }
        }
        reasons
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    RecommendationsReady(RecommendationResult),
    Exhausted(ExhaustedReport),
}

/// Orchestrator states, also used as progress step names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Initial,
    LineAssigned,
    KnowledgeUpdated,
    MomentClassified,
    Strategizing,
    Discovering,
    Filtering,
    RecommendationsReady,
    Exhausted,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initial => "initial",
            Self::LineAssigned => "line_assigned",
            Self::KnowledgeUpdated => "knowledge_updated",
            Self::MomentClassified => "moment_classified",
            Self::Strategizing => "strategizing",
            Self::Discovering => "discovering",
            Self::Filtering => "filtering",
            Self::RecommendationsReady => "recommendations_ready",
            Self::Exhausted => "exhausted",
        };
        f.write_str(s)
    }
}

/// One event on the progress stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Step {
        step: PipelineState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Complete {
        data: RecommendationResult,
    },
    Exhausted {
        data: ExhaustedReport,
    },
    Error {
        message: String,
    },
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Step { .. })
    }
}

// ---------------------------------------------------------------------------
// Interactions
// ---------------------------------------------------------------------------

/// A user action on recommended content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "interaction_type", rename_all = "snake_case")]
pub enum InteractionKind {
    ReadStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        section: Option<String>,
    },
    ReadEnd {
        read_duration_seconds: u64,
        completed: bool,
    },
    Highlight {
        highlighted_text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        surrounding_context: Option<String>,
    },
    ClickReference {
        reference_text: String,
        reference_url: String,
    },
    ProgressUpdate {
        progress: f64,
    },
    FollowUpQuery {
        query: String,
    },
}

impl InteractionKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadStart { .. } => "read_start",
            Self::ReadEnd { .. } => "read_end",
            Self::Highlight { .. } => "highlight",
            Self::ClickReference { .. } => "click_reference",
            Self::ProgressUpdate { .. } => "progress_update",
            Self::FollowUpQuery { .. } => "follow_up_query",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub user_id: String,
    pub content_id: String,
    #[serde(flatten)]
    pub kind: InteractionKind,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(concept: &str, level: f64, evidence: &[&str]) -> ConceptChange {
        ConceptChange {
            concept: concept.into(),
            line_id: None,
            demonstration_level: level,
            evidence: evidence.iter().map(|s| s.to_string()).collect(),
            exposures: vec![],
            confusions: vec![],
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn line_id_roundtrip() {
        let id = LineId::new();
        let parsed: LineId = id.to_string().parse().expect("parse LineId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn content_id_is_stable_prefix() {
        let id = content_id("https://example.com/a");
        assert_eq!(id.len(), 16);
        assert_eq!(id, content_id("https://example.com/a"));
        assert_ne!(id, content_id("https://example.com/b"));
    }

    #[test]
    fn merge_takes_max_and_unions_evidence() {
        let mut state = KnowledgeState::empty("u1");
        state.merge(&KnowledgeDelta {
            changes: vec![change("gpu", 0.4, &["connected gpu to demand"])],
            seen_content: vec![],
        });
        state.merge(&KnowledgeDelta {
            changes: vec![change("gpu", 0.2, &["connected gpu to demand", "challenged gpu"])],
            seen_content: vec![],
        });

        let record = &state.concepts["gpu"];
        assert_eq!(record.demonstration_level, 0.4);
        assert_eq!(record.evidence.len(), 2);
        assert_eq!(state.version, 2);
    }

    #[test]
    fn merge_order_does_not_change_level() {
        let a = KnowledgeDelta {
            changes: vec![change("cuda", 0.3, &["a"])],
            seen_content: vec![],
        };
        let b = KnowledgeDelta {
            changes: vec![change("cuda", 0.6, &["b"])],
            seen_content: vec![],
        };

        let mut ab = KnowledgeState::empty("u1");
        ab.merge(&a);
        ab.merge(&b);
        let mut ba = KnowledgeState::empty("u1");
        ba.merge(&b);
        ba.merge(&a);

        assert_eq!(ab.level("cuda"), ba.level("cuda"));
    }

    #[test]
    fn merging_the_same_delta_twice_keeps_the_version() {
        let line = LineId::new();
        let delta = KnowledgeDelta {
            changes: vec![ConceptChange {
                line_id: Some(line),
                ..change("gpu", 0.4, &["connected gpu to demand"])
            }],
            seen_content: vec!["c1".into()],
        };
        let mut state = KnowledgeState::empty("u1");
        assert!(state.merge(&delta));
        assert!(!state.merge(&delta));
        assert_eq!(state.version, 1);
        assert_eq!(state.concepts["gpu"].level_on(line), 0.4);
    }

    #[test]
    fn line_levels_only_follow_demonstrations() {
        let (a, b) = (LineId::new(), LineId::new());
        let mut state = KnowledgeState::empty("u1");
        state.merge(&KnowledgeDelta {
            changes: vec![
                ConceptChange {
                    line_id: Some(a),
                    ..change("gpu", 0.25, &["applied gpu"])
                },
                ConceptChange {
                    line_id: Some(b),
                    exposures: vec!["asked about gpu".into()],
                    ..change("gpu", 0.0, &[])
                },
            ],
            seen_content: vec![],
        });

        let record = &state.concepts["gpu"];
        assert_eq!(record.line_ids.len(), 2);
        assert_eq!(record.level_on(b), 0.0);
        assert_eq!(record.demonstrated_elsewhere(b).collect::<Vec<_>>(), vec![(a, 0.25)]);
        assert!(record.demonstrated_elsewhere(a).next().is_none());

        state.reset_concept("gpu");
        assert!(state.concepts["gpu"].line_levels.is_empty());
    }

    #[test]
    fn reset_is_the_only_way_down() {
        let mut state = KnowledgeState::empty("u1");
        state.merge(&KnowledgeDelta {
            changes: vec![change("tam", 0.5, &["applied tam"])],
            seen_content: vec![],
        });
        assert!(state.reset_concept("tam"));
        assert_eq!(state.level("tam"), 0.0);
        assert!(!state.reset_concept("unknown"));
        assert!(state.concepts["tam"].evidence.len() >= 2);
    }

    #[test]
    fn progress_event_wire_format() {
        let event = ProgressEvent::Step {
            step: PipelineState::MomentClassified,
            detail: Some("concept_struggle".into()),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "step");
        assert_eq!(json["step"], "moment_classified");
        assert!(!event.is_terminal());

        let error = ProgressEvent::Error {
            message: "boom".into(),
        };
        assert!(error.is_terminal());
    }

    #[test]
    fn interaction_wire_format() {
        let json = r#"{
            "user_id": "u1",
            "content_id": "abcd",
            "interaction_type": "read_end",
            "read_duration_seconds": 120,
            "completed": true,
            "timestamp": "2025-01-15T10:30:00Z"
        }"#;
        let parsed: Interaction = serde_json::from_str(json).expect("deserialize");
        assert_eq!(parsed.kind.name(), "read_end");
        assert!(matches!(
            parsed.kind,
            InteractionKind::ReadEnd {
                read_duration_seconds: 120,
                completed: true
            }
        ));
    }

    #[test]
    fn depth_steps_are_bounded() {
        assert_eq!(Depth::Expert.deeper(), Depth::Expert);
        assert_eq!(Depth::Introductory.shallower(), Depth::Introductory);
        assert!(Depth::Introductory.deeper() > Depth::Introductory);
    }
}
