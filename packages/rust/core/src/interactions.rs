//! Aggregation of user interactions with recommended content.

use std::collections::HashSet;

use learnline_shared::{Interaction, InteractionKind};
use serde::{Deserialize, Serialize};

/// How a user engaged with one piece of content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentEngagement {
    pub content_id: String,
    pub total_read_seconds: u64,
    pub completed: bool,
    pub highlights: Vec<String>,
    pub clicked_references: Vec<String>,
    pub follow_up_queries: Vec<String>,
    /// Furthest reading progress reported, in `[0, 1]`.
    pub max_progress: f64,
    pub interaction_count: usize,
}

/// Fold every interaction on `content_id` into a [`ContentEngagement`].
pub fn engagement(content_id: &str, interactions: &[Interaction]) -> ContentEngagement {
    let mut summary = ContentEngagement {
        content_id: content_id.to_string(),
        ..ContentEngagement::default()
    };
    for interaction in interactions.iter().filter(|i| i.content_id == content_id) {
        summary.interaction_count += 1;
        match &interaction.kind {
            InteractionKind::ReadStart { .. } => {}
            InteractionKind::ReadEnd {
                read_duration_seconds,
                completed,
            } => {
                summary.total_read_seconds += read_duration_seconds;
                summary.completed |= completed;
                if *completed {
                    summary.max_progress = 1.0;
                }
            }
            InteractionKind::Highlight {
                highlighted_text, ..
            } => summary.highlights.push(highlighted_text.clone()),
            InteractionKind::ClickReference { reference_url, .. } => {
                summary.clicked_references.push(reference_url.clone())
            }
            InteractionKind::ProgressUpdate { progress } => {
                summary.max_progress = summary.max_progress.max(progress.clamp(0.0, 1.0));
            }
            InteractionKind::FollowUpQuery { query } => {
                summary.follow_up_queries.push(query.clone())
            }
        }
    }
    summary
}

/// The `limit` most recent distinct follow-up queries asked from one of
/// `content_ids`, newest first.
pub fn follow_up_queries(
    interactions: &[Interaction],
    content_ids: &HashSet<String>,
    limit: usize,
) -> Vec<String> {
    let mut queries: Vec<String> = Vec::new();
    for interaction in interactions.iter().rev() {
        if !content_ids.contains(&interaction.content_id) {
            continue;
        }
        if let InteractionKind::FollowUpQuery { query } = &interaction.kind {
            let query = query.trim();
            if !query.is_empty() && !queries.iter().any(|q| q.eq_ignore_ascii_case(query)) {
                queries.push(query.to_string());
            }
        }
        if queries.len() == limit {
            break;
        }
    }
    queries
}
