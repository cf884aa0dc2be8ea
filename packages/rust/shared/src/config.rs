//! Application configuration for Learnline.
//!
//! User config lives at `~/.learnline/learnline.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LearnlineError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "learnline.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".learnline";

// ---------------------------------------------------------------------------
// Config structs (matching learnline.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Database location.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Answering service settings.
    #[serde(default)]
    pub answering: AnsweringConfig,

    /// Content discovery settings.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Orchestrator bounds.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Query line continuity tuning.
    #[serde(default)]
    pub lines: LineConfig,

    /// Learning moment thresholds.
    #[serde(default)]
    pub moments: MomentConfig,

    /// Relevance filter floors.
    #[serde(default)]
    pub filter: FilterConfig,

    /// Extra entity lexicon entries merged over the built-in one.
    #[serde(default)]
    pub entities: Vec<EntityEntry>,
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the libSQL database file. A leading `~` expands to the home dir.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl StorageConfig {
    /// Resolve `db_path`, expanding a leading `~`.
    pub fn resolved_db_path(&self) -> Result<PathBuf> {
        match self.db_path.strip_prefix("~/") {
            Some(rest) => {
                let home = dirs::home_dir()
                    .ok_or_else(|| LearnlineError::config("could not determine home directory"))?;
                Ok(home.join(rest))
            }
            None => Ok(PathBuf::from(&self.db_path)),
        }
    }
}

fn default_db_path() -> String {
    "~/.learnline/learnline.db".into()
}

/// `[answering]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnsweringConfig {
    /// Base URL of the chat-completions compatible answering API.
    #[serde(default = "default_answering_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model identifier sent with every request.
    #[serde(default = "default_model")]
    pub model: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_answering_timeout")]
    pub timeout_secs: u64,

    /// Attempts per call, including the first one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for AnsweringConfig {
    fn default() -> Self {
        Self {
            base_url: default_answering_url(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            timeout_secs: default_answering_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_answering_url() -> String {
    "https://api.perplexity.ai".into()
}
fn default_api_key_env() -> String {
    "PERPLEXITY_API_KEY".into()
}
fn default_model() -> String {
    "sonar".into()
}
fn default_answering_timeout() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}

/// `[discovery]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Maximum candidate pages returned per search query.
    #[serde(default = "default_max_results")]
    pub max_results_per_query: usize,

    /// Maximum concurrent discovery tasks within one strategy round.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Timeout for fetching a single page, in seconds.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Attempts per discovery call, including the first one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff delay in milliseconds (doubles each retry).
    #[serde(default = "default_retry_delay")]
    pub retry_base_delay_ms: u64,

    /// Hosts whose citations are never fetched (video sites and the like).
    #[serde(default = "default_blocked_hosts")]
    pub blocked_hosts: Vec<String>,

    /// How long an extracted page stays valid in the content cache.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_hours: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_results_per_query: default_max_results(),
            concurrency: default_concurrency(),
            fetch_timeout_secs: default_fetch_timeout(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_delay(),
            blocked_hosts: default_blocked_hosts(),
            cache_ttl_hours: default_cache_ttl(),
        }
    }
}

fn default_max_results() -> usize {
    5
}
fn default_concurrency() -> usize {
    4
}
fn default_fetch_timeout() -> u64 {
    20
}
fn default_retry_delay() -> u64 {
    500
}
fn default_blocked_hosts() -> Vec<String> {
    vec!["youtube.com".into(), "youtu.be".into()]
}
fn default_cache_ttl() -> u64 {
    24 * 7
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Strategy attempts before a run is declared exhausted.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Search queries per strategy attempt.
    #[serde(default = "default_max_queries")]
    pub max_queries_per_strategy: usize,

    /// Recommendations returned from a successful run.
    #[serde(default = "default_max_recommendations")]
    pub max_recommendations: usize,

    /// Most recently active lines considered for continuation.
    #[serde(default = "default_recent_lines")]
    pub recent_lines_limit: usize,

    /// Most recently active lines considered when discovering relations.
    #[serde(default = "default_related_limit")]
    pub related_candidate_limit: usize,

    /// Interactions loaded per run.
    #[serde(default = "default_interaction_limit")]
    pub interaction_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_queries_per_strategy: default_max_queries(),
            max_recommendations: default_max_recommendations(),
            recent_lines_limit: default_recent_lines(),
            related_candidate_limit: default_related_limit(),
            interaction_limit: default_interaction_limit(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_max_queries() -> usize {
    5
}
fn default_max_recommendations() -> usize {
    5
}
fn default_recent_lines() -> usize {
    100
}
fn default_related_limit() -> usize {
    20
}
fn default_interaction_limit() -> usize {
    200
}

/// `[lines]` section.
///
/// A query continues a line when
/// `goal_weight * goal + topic_weight * topic + building_weight * building`
/// reaches `continuation_threshold`. Each signal lies in `[0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineConfig {
    #[serde(default = "default_goal_weight")]
    pub goal_weight: f64,
    #[serde(default = "default_topic_weight")]
    pub topic_weight: f64,
    #[serde(default = "default_building_weight")]
    pub building_weight: f64,
    #[serde(default = "default_continuation_threshold")]
    pub continuation_threshold: f64,
    /// Minimum relation score for `find_related`.
    #[serde(default = "default_relation_threshold")]
    pub relation_threshold: f64,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            goal_weight: default_goal_weight(),
            topic_weight: default_topic_weight(),
            building_weight: default_building_weight(),
            continuation_threshold: default_continuation_threshold(),
            relation_threshold: default_relation_threshold(),
        }
    }
}

fn default_goal_weight() -> f64 {
    0.55
}
fn default_topic_weight() -> f64 {
    0.30
}
fn default_building_weight() -> f64 {
    0.15
}
fn default_continuation_threshold() -> f64 {
    0.5
}
fn default_relation_threshold() -> f64 {
    0.35
}

/// `[moments]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MomentConfig {
    /// A rule only emits a moment at or above this confidence.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Demonstration level below which a concept counts as partially understood.
    #[serde(default = "default_struggle_level")]
    pub struggle_level_threshold: f64,

    /// Prior same-concept queries that trigger a struggle on their own.
    #[serde(default = "default_struggle_attempts")]
    pub min_struggle_attempts: usize,

    /// Sibling entities a line must touch before it reads as breadth without depth.
    #[serde(default = "default_breadth_entities")]
    pub min_breadth_entities: usize,
}

impl Default for MomentConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            struggle_level_threshold: default_struggle_level(),
            min_struggle_attempts: default_struggle_attempts(),
            min_breadth_entities: default_breadth_entities(),
        }
    }
}

fn default_min_confidence() -> f64 {
    0.55
}
fn default_struggle_level() -> f64 {
    0.6
}
fn default_struggle_attempts() -> usize {
    2
}
fn default_breadth_entities() -> usize {
    3
}

/// `[filter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Relevance floor for background content on a brand-new topic.
    #[serde(default = "default_no_context_relevance")]
    pub no_context_min_relevance: f64,

    /// Lower floor used when the content offers a path forward.
    #[serde(default = "default_path_relevance")]
    pub no_context_path_relevance: f64,

    #[serde(default = "default_with_context_relevance")]
    pub with_context_min_relevance: f64,

    /// Share of a candidate's key terms that must be new to the user.
    #[serde(default = "default_novelty_floor")]
    pub novelty_floor: f64,

    #[serde(default = "default_struggle_relevance")]
    pub struggle_min_relevance: f64,

    /// Mentions of the chosen entity a goal-direction candidate needs.
    #[serde(default = "default_direction_mentions")]
    pub direction_min_mentions: usize,

    /// Other sibling entities tolerated before a candidate counts as breadth.
    #[serde(default = "default_direction_breadth")]
    pub direction_max_siblings: usize,

    #[serde(default = "default_neutral_relevance")]
    pub neutral_min_relevance: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            no_context_min_relevance: default_no_context_relevance(),
            no_context_path_relevance: default_path_relevance(),
            with_context_min_relevance: default_with_context_relevance(),
            novelty_floor: default_novelty_floor(),
            struggle_min_relevance: default_struggle_relevance(),
            direction_min_mentions: default_direction_mentions(),
            direction_max_siblings: default_direction_breadth(),
            neutral_min_relevance: default_neutral_relevance(),
        }
    }
}

fn default_no_context_relevance() -> f64 {
    0.2
}
fn default_path_relevance() -> f64 {
    0.1
}
fn default_with_context_relevance() -> f64 {
    0.3
}
fn default_novelty_floor() -> f64 {
    0.3
}
fn default_struggle_relevance() -> f64 {
    0.3
}
fn default_direction_mentions() -> usize {
    2
}
fn default_direction_breadth() -> usize {
    1
}
fn default_neutral_relevance() -> f64 {
    0.25
}

/// `[[entities]]` entry, a named entity and the sector it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityEntry {
    /// Canonical lowercase name.
    pub name: String,
    /// Alternative spellings that map to `name`.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Sector grouping sibling entities (e.g. `semiconductors`).
    pub sector: String,
}

impl AppConfig {
    /// Check ranges and cross-field constraints the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        let lines = &self.lines;
        unit("lines.goal_weight", lines.goal_weight)?;
        unit("lines.topic_weight", lines.topic_weight)?;
        unit("lines.building_weight", lines.building_weight)?;
        unit("lines.continuation_threshold", lines.continuation_threshold)?;
        unit("lines.relation_threshold", lines.relation_threshold)?;

        let moments = &self.moments;
        unit("moments.min_confidence", moments.min_confidence)?;
        unit("moments.struggle_level_threshold", moments.struggle_level_threshold)?;
        positive("moments.min_struggle_attempts", moments.min_struggle_attempts)?;
        if moments.min_breadth_entities < 2 {
            return Err(LearnlineError::config(
                "moments.min_breadth_entities must be at least 2",
            ));
        }

        let filter = &self.filter;
        unit("filter.no_context_min_relevance", filter.no_context_min_relevance)?;
        unit("filter.no_context_path_relevance", filter.no_context_path_relevance)?;
        unit("filter.with_context_min_relevance", filter.with_context_min_relevance)?;
        unit("filter.novelty_floor", filter.novelty_floor)?;
        unit("filter.struggle_min_relevance", filter.struggle_min_relevance)?;
        unit("filter.neutral_min_relevance", filter.neutral_min_relevance)?;
        positive("filter.direction_min_mentions", filter.direction_min_mentions)?;

        let pipeline = &self.pipeline;
        positive("pipeline.max_recommendations", pipeline.max_recommendations)?;
        positive("pipeline.recent_lines_limit", pipeline.recent_lines_limit)?;
        positive("pipeline.related_candidate_limit", pipeline.related_candidate_limit)?;
        positive("pipeline.interaction_limit", pipeline.interaction_limit)?;
        positive("discovery.max_results_per_query", self.discovery.max_results_per_query)?;

        if lines.topic_weight + lines.building_weight >= lines.continuation_threshold {
            return Err(LearnlineError::config(format!(
                "lines: topic_weight + building_weight ({}) must stay below \
                 continuation_threshold ({}) so topical overlap alone never merges lines",
                lines.topic_weight + lines.building_weight,
                lines.continuation_threshold
            )));
        }
        if self.filter.struggle_min_relevance < self.filter.no_context_min_relevance {
            return Err(LearnlineError::config(
                "filter: struggle_min_relevance must not be below no_context_min_relevance",
            ));
        }
        if self.pipeline.max_attempts == 0 {
            return Err(LearnlineError::config("pipeline: max_attempts must be at least 1"));
        }
        if self.pipeline.max_queries_per_strategy == 0 || self.pipeline.max_queries_per_strategy > 5 {
            return Err(LearnlineError::config(
                "pipeline: max_queries_per_strategy must be between 1 and 5",
            ));
        }
        if self.discovery.concurrency == 0 {
            return Err(LearnlineError::config("discovery: concurrency must be at least 1"));
        }
        Ok(())
    }
}

/// Reject weights and thresholds outside `[0, 1]` (NaN included).
fn unit(field: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(LearnlineError::config(format!(
            "{field} must be between 0 and 1, got {value}"
        )))
    }
}

fn positive(field: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(LearnlineError::config(format!("{field} must be at least 1")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.learnline/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| LearnlineError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.learnline/learnline.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| LearnlineError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        LearnlineError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| LearnlineError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| LearnlineError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| LearnlineError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the answering service API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.answering.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(LearnlineError::config(format!(
            "answering service API key not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("db_path"));
        assert!(toml_str.contains("PERPLEXITY_API_KEY"));
        assert!(toml_str.contains("continuation_threshold"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.pipeline.max_attempts, 3);
        assert_eq!(parsed.answering.api_key_env, "PERPLEXITY_API_KEY");
        assert!(parsed.discovery.blocked_hosts.contains(&"youtube.com".to_string()));
    }

    #[test]
    fn default_config_is_valid() {
        AppConfig::default().validate().expect("defaults validate");
    }

    #[test]
    fn config_with_entities() {
        let toml_str = r#"
[pipeline]
max_attempts = 2

[[entities]]
name = "cerebras"
aliases = ["cerebras systems"]
sector = "semiconductors"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.pipeline.max_attempts, 2);
        assert_eq!(config.pipeline.max_recommendations, 5);
        assert_eq!(config.entities.len(), 1);
        assert_eq!(config.entities[0].sector, "semiconductors");
    }

    #[test]
    fn topic_only_weights_rejected() {
        let mut config = AppConfig::default();
        config.lines.topic_weight = 0.45;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("topical overlap alone"));
    }

    #[test]
    fn out_of_range_values_name_the_field() {
        let cases: &[(&str, fn(&mut AppConfig))] = &[
            ("lines.continuation_threshold", |c: &mut AppConfig| c.lines.continuation_threshold = 1.5),
            ("lines.goal_weight", |c: &mut AppConfig| c.lines.goal_weight = -0.1),
            ("lines.relation_threshold", |c: &mut AppConfig| c.lines.relation_threshold = f64::NAN),
            ("moments.min_confidence", |c: &mut AppConfig| c.moments.min_confidence = 2.0),
            ("moments.struggle_level_threshold", |c: &mut AppConfig| {
                c.moments.struggle_level_threshold = -1.0
            }),
            ("moments.min_struggle_attempts", |c: &mut AppConfig| c.moments.min_struggle_attempts = 0),
            ("moments.min_breadth_entities", |c: &mut AppConfig| c.moments.min_breadth_entities = 1),
            ("filter.novelty_floor", |c: &mut AppConfig| c.filter.novelty_floor = 1.01),
            ("filter.neutral_min_relevance", |c: &mut AppConfig| c.filter.neutral_min_relevance = -0.5),
            ("filter.direction_min_mentions", |c: &mut AppConfig| c.filter.direction_min_mentions = 0),
            ("pipeline.max_recommendations", |c: &mut AppConfig| c.pipeline.max_recommendations = 0),
            ("pipeline.recent_lines_limit", |c: &mut AppConfig| c.pipeline.recent_lines_limit = 0),
            ("pipeline.related_candidate_limit", |c: &mut AppConfig| c.pipeline.related_candidate_limit = 0),
            ("pipeline.interaction_limit", |c: &mut AppConfig| c.pipeline.interaction_limit = 0),
            ("discovery.max_results_per_query", |c: &mut AppConfig| c.discovery.max_results_per_query = 0),
        ];
        for &(field, breaks) in cases {
            let mut config = AppConfig::default();
            breaks(&mut config);
            let err = config.validate().unwrap_err().to_string();
            assert!(err.contains(field), "{field}: {err}");
        }
    }

    #[test]
    fn zero_attempts_rejected() {
        let mut config = AppConfig::default();
        config.pipeline.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn db_path_expands_home() {
        let storage = StorageConfig {
            db_path: "/tmp/learnline.db".into(),
        };
        assert_eq!(
            storage.resolved_db_path().unwrap(),
            PathBuf::from("/tmp/learnline.db")
        );
        let home_relative = StorageConfig::default().resolved_db_path().unwrap();
        assert!(home_relative.ends_with(".learnline/learnline.db"));
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.answering.api_key_env = "LL_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
