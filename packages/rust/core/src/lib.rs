//! Core pipeline and domain logic for Learnline.
//!
//! This crate turns a user's query into learning recommendations: it assigns
//! the query to a query line, updates the user's knowledge state, classifies
//! the learning moment, and drives the strategy → discovery → filtering
//! retry loop (see [`pipeline::Pipeline`]).

pub mod filter;
pub mod interactions;
pub mod knowledge;
pub mod lines;
pub mod moments;
pub mod pipeline;
pub mod strategy;
pub mod suggestions;
pub mod text;

pub use filter::{Candidate, Evaluation, RelevanceFilter};
pub use interactions::{ContentEngagement, engagement, follow_up_queries};
pub use knowledge::KnowledgeStateTracker;
pub use lines::{ContinuityScore, LineChoice, QueryLineManager};
pub use moments::MomentClassifier;
pub use pipeline::{
    ChannelProgress, Pipeline, ProgressReporter, Services, SilentProgress, validate_interaction,
};
pub use strategy::{FailureFeedback, StrategyGenerator};
pub use suggestions::SuggestionBuilder;
pub use text::Lexicon;
