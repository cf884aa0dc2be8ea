//! Shared types, error model, and configuration for Learnline.
//!
//! This crate is the foundation depended on by all other Learnline crates.
//! It provides:
//! - [`LearnlineError`], the unified error type
//! - Domain types ([`QueryLine`], [`KnowledgeState`], [`LearningMoment`], [`SearchStrategy`], ...)
//! - Configuration ([`AppConfig`] and its sections, config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AnsweringConfig, AppConfig, DiscoveryConfig, EntityEntry, FilterConfig, LineConfig,
    MomentConfig, PipelineConfig, StorageConfig, config_dir, config_file_path, init_config,
    load_config, load_config_from, validate_api_key,
};
pub use error::{LearnlineError, Result};
pub use types::{
    Angle, AttemptFailure, ConceptChange, ConceptRecord, ContentMetadata, ContentSection, Depth,
    ExhaustedReport, ExtractedDocument, GoalFrame, Interaction, InteractionKind, KnowledgeDelta,
    KnowledgeState, KnowledgeView, LearningMoment, LearningPath, LineAnalysis, LineId, Metric,
    MetricKind, MomentKind, PipelineState, ProgressEvent, Query, QueryLine, Recommendation,
    RecommendationResult, Rejection, RejectionReason, RunOutcome, SearchQuery, SearchStrategy,
    Suggestions, content_id,
};
